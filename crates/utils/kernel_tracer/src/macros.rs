// 级别过滤在 `log_impl` 中进行，参数只在需要输出时才被格式化

#[macro_export]
macro_rules! error {
    ($($arg:tt)+) => {
        $crate::log_impl($crate::Level::Error, ::core::format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)+) => {
        $crate::log_impl($crate::Level::Warn, ::core::format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)+) => {
        $crate::log_impl($crate::Level::Info, ::core::format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => {
        $crate::log_impl($crate::Level::Debug, ::core::format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)+) => {
        $crate::log_impl($crate::Level::Trace, ::core::format_args!($($arg)+))
    };
}
