//! Logging macros
//!
//! Forwards to `defmt` when the `defmt` feature is enabled, otherwise to `log`
//! when the `log` feature is enabled. With neither, the macros expand to
//! nothing but still reference their arguments.
#![allow(unused_macros)]

macro_rules! log_dispatch {
    ($level:ident, $s:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(feature = "defmt")]
            ::defmt::$level!($s $(, $x)*);
            #[cfg(all(feature = "log", not(feature = "defmt")))]
            ::log::$level!($s $(, $x)*);
            #[cfg(not(any(feature = "log", feature = "defmt")))]
            let _ = ($( & $x, )*);
        }
    };
}

macro_rules! trace {
    ($($arg:tt)*) => { log_dispatch!(trace, $($arg)*) };
}

macro_rules! debug {
    ($($arg:tt)*) => { log_dispatch!(debug, $($arg)*) };
}

macro_rules! info {
    ($($arg:tt)*) => { log_dispatch!(info, $($arg)*) };
}

macro_rules! warn {
    ($($arg:tt)*) => { log_dispatch!(warn, $($arg)*) };
}

macro_rules! error {
    ($($arg:tt)*) => { log_dispatch!(error, $($arg)*) };
}
