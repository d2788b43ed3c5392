use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:tt)*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg)*)
    }};
}

/// Traffic written to an SMTP client
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::outgoing!(level = TRACE, $($msg)*)
    };
}

/// Traffic read from an SMTP client
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "incoming", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::incoming!(level = TRACE, $($msg)*)
    };
}

#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::internal!(level = TRACE, $($msg)*)
    };
}

/// Parse a level name as accepted in the configuration file.
///
/// Besides the `tracing` names this accepts `warning` and `critical`, which
/// older relay configurations use.
pub fn parse_level(level: &str) -> Option<LevelFilter> {
    match level.to_ascii_lowercase().as_str() {
        "warning" => Some(LevelFilter::WARN),
        "critical" => Some(LevelFilter::ERROR),
        other => LevelFilter::from_str(other).ok(),
    }
}

/// Install the global subscriber.
///
/// The configured level wins, then `LOG_LEVEL`, then a build-dependent default.
/// Returns whether the subscriber was installed. A subscriber that is
/// already in place is kept and the failure reported on stderr.
pub fn init(configured: Option<LevelFilter>) -> bool {
    let default = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    let level = configured.unwrap_or_else(|| {
        std::env::var("LOG_LEVEL").map_or(default, |level| {
            parse_level(&level).unwrap_or_else(|| {
                eprintln!("Invalid log level specified {level}, defaulting to {default}");
                default
            })
        })
    });

    let installed = tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .compact()
                .with_ansi(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with("conduit")
                })),
        )
        .try_init();

    if let Err(err) = &installed {
        eprintln!("Unable to install log subscriber: {err}");
    }

    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_legacy_level_names() {
        assert_eq!(parse_level("WARNING"), Some(LevelFilter::WARN));
        assert_eq!(parse_level("critical"), Some(LevelFilter::ERROR));
        assert_eq!(parse_level("debug"), Some(LevelFilter::DEBUG));
        assert_eq!(parse_level("Info"), Some(LevelFilter::INFO));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn second_init_keeps_the_first_subscriber() {
        init(Some(LevelFilter::INFO));

        assert!(!init(Some(LevelFilter::DEBUG)));
    }
}
