/// Emit a machine readable stat line for offline analysis.
///
/// The lines are picked up by the plotting scripts. Compiled out unless the
/// `_internal_dont_use_log_stats` feature is enabled.
#[cfg(feature = "_internal_dont_use_log_stats")]
macro_rules! log_stat {
    ($name:expr, $($arg:expr),+) => {
        {
            use std::io::{self, Write};
            use std::time::SystemTime;

            let since_epoch = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .expect("clock before unix epoch");
            let unix_time_ms = since_epoch.as_millis();
            let mut lock = io::stdout().lock();
            write!(lock, "{} ", $name).expect("write to stdout");
            $(
                write!(lock, "{},", $arg).expect("write to stdout");
            )+
            writeln!(lock, "{}", unix_time_ms).expect("write to stdout");
        }
    };
}

#[cfg(not(feature = "_internal_dont_use_log_stats"))]
macro_rules! log_stat {
    ($name:expr, $($arg:expr),+) => {
        {
            let _ = $name;
            $(
                let _ = &$arg;
            )+
        }
    };
}

pub(crate) use log_stat;
