//! Logging macros
//!
//! Each level forwards to [`__log`](crate::__log), which is bound to `defmt`, `log` or
//! nothing depending on the enabled feature. With no backend the arguments are still
//! evaluated by reference so that they do not trigger unused warnings.

#[cfg(all(feature = "log", feature = "defmt", not(doc)))]
compile_error!("features `log` and `defmt` are mutually exclusive");

#[cfg(all(not(doc), feature = "defmt"))]
#[doc(hidden)]
#[macro_export]
#[collapse_debuginfo(yes)]
macro_rules! __log {
    ($level:ident, $s:literal $(, $x:expr)* $(,)?) => {
        {
            ::defmt::$level!($s $(, $x)*);
        }
    };
}

#[cfg(all(not(doc), feature = "log"))]
#[doc(hidden)]
#[macro_export]
#[collapse_debuginfo(yes)]
macro_rules! __log {
    ($level:ident, $s:literal $(, $x:expr)* $(,)?) => {
        {
            ::log::$level!($s $(, $x)*);
        }
    };
}

#[cfg(any(doc, not(any(feature = "defmt", feature = "log"))))]
#[doc(hidden)]
#[macro_export]
#[collapse_debuginfo(yes)]
macro_rules! __log {
    ($level:ident, $s:literal $(, $x:expr)* $(,)?) => {
        {
            let _ = ($( & $x ),*);
        }
    };
}

/// Logs a trace message using the underlying logger
#[macro_export]
#[collapse_debuginfo(yes)]
macro_rules! trace {
    ($s:literal $(, $x:expr)* $(,)?) => {
        $crate::__log!(trace, $s $(, $x)*)
    };
}

/// Logs a debug message using the underlying logger
#[macro_export]
#[collapse_debuginfo(yes)]
macro_rules! debug {
    ($s:literal $(, $x:expr)* $(,)?) => {
        $crate::__log!(debug, $s $(, $x)*)
    };
}

/// Logs an info message using the underlying logger
#[macro_export]
#[collapse_debuginfo(yes)]
macro_rules! info {
    ($s:literal $(, $x:expr)* $(,)?) => {
        $crate::__log!(info, $s $(, $x)*)
    };
}

/// Logs a warning using the underlying logger
#[macro_export]
#[collapse_debuginfo(yes)]
macro_rules! warn {
    ($s:literal $(, $x:expr)* $(,)?) => {
        $crate::__log!(warn, $s $(, $x)*)
    };
}

/// Logs an error using the underlying logger
#[macro_export]
#[collapse_debuginfo(yes)]
macro_rules! error {
    ($s:literal $(, $x:expr)* $(,)?) => {
        $crate::__log!(error, $s $(, $x)*)
    };
}

#[cfg(test)]
mod test {
    #[test]
    fn test_levels_accept_arguments() {
        let value = 3u32;
        crate::trace!("plain");
        crate::debug!("value {}", value);
        crate::info!("values {} {}", value, value + 1,);
        crate::warn!("warn {:?}", Some(value));
        crate::error!("error {}", value);
    }
}
