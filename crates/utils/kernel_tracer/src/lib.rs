#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
mod macros;
mod level;

pub use level::{Level, LevelFilter, CLOG};

use core::fmt::{self, Write};

use anstyle::{AnsiColor, Reset};
use spin::Once;

/// 日志的输出端。内核中一般是串口，测试时可以是一块内存
pub trait Log: Sync + Send {
    fn write_str(&self, s: &str);
}

static SINK: Once<&'static dyn Log> = Once::new();

/// 注册日志输出端，只有第一次注册有效
pub fn set_sink(sink: &'static dyn Log) {
    SINK.call_once(|| sink);
}

/// 按 `[LEVEL] message` 的格式写出一条日志，日志级别带颜色
pub fn write_record(writer: &mut impl Write, level: Level, args: fmt::Arguments<'_>) -> fmt::Result {
    let color = match level {
        Level::Error => AnsiColor::Red,
        Level::Warn => AnsiColor::BrightYellow,
        Level::Info => AnsiColor::Blue,
        Level::Debug => AnsiColor::Green,
        Level::Trace => AnsiColor::BrightBlack,
    };
    writeln!(
        writer,
        "{}[{:>5}]{} {}",
        color.render_fg(),
        level,
        Reset.render(),
        args
    )
}

/// 把格式化结果转发给 [`Log`]
struct SinkWriter(&'static dyn Log);

impl Write for SinkWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

#[inline]
#[doc(hidden)]
pub fn log_impl(level: Level, args: fmt::Arguments<'_>) {
    if !level.enabled(CLOG) {
        return;
    }
    if let Some(sink) = SINK.get() {
        let _ = write_record(&mut SinkWriter(*sink), level, args);
        return;
    }
    #[cfg(any(test, feature = "std"))]
    {
        let mut line = String::new();
        if write_record(&mut line, level, args).is_ok() {
            eprint!("{line}");
        }
    }
}
