use core::fmt;

/// 日志级别，越往后越详细
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Level {
    Error = 1,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Level {
    const fn name(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    /// 该级别的日志在 `filter` 下是否输出
    #[inline]
    pub fn enabled(self, filter: LevelFilter) -> bool {
        self as u8 <= filter as u8
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// 输出级别的上限，`Off` 表示什么都不输出
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LevelFilter {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LevelFilter {
    /// 只认全大写的级别名，其他一律视为 `Off`
    const fn parse(name: &str) -> Self {
        const FILTERS: [(&str, LevelFilter); 5] = [
            ("ERROR", LevelFilter::Error),
            ("WARN", LevelFilter::Warn),
            ("INFO", LevelFilter::Info),
            ("DEBUG", LevelFilter::Debug),
            ("TRACE", LevelFilter::Trace),
        ];
        let mut i = 0;
        while i < FILTERS.len() {
            if bytes_eq(FILTERS[i].0.as_bytes(), name.as_bytes()) {
                return FILTERS[i].1;
            }
            i += 1;
        }
        LevelFilter::Off
    }
}

const fn bytes_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    if lhs.len() != rhs.len() {
        return false;
    }
    let mut i = 0;
    while i < lhs.len() {
        if lhs[i] != rhs[i] {
            return false;
        }
        i += 1;
    }
    true
}

/// 编译期决定的日志级别，由环境变量 `KERNEL_CLOG` 指定，默认关闭
pub const CLOG: LevelFilter = match option_env!("KERNEL_CLOG") {
    Some(name) => LevelFilter::parse(name),
    None => LevelFilter::Off,
};
