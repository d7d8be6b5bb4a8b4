// src/macros.rs

//
// Logging macros
//
// logging feature enabled  -> tracing events
// logging feature disabled -> log_error prints to stderr, the rest compile
//                             to a unit expression that still type-checks
//                             (and consumes) its arguments
//
// Every variant is an expression of type `()`, so call sites may use them
// as match arms without braces.
//

#![allow(unused_macros)]

// --------------------
// ERROR
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_error {
    ($($arg:tt)*) => {
        tracing::error!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_error {
    ($($arg:tt)*) => {
        eprintln!($($arg)*)
    };
}

// --------------------
// Disabled levels
// --------------------

// Never evaluated; only keeps the arguments used and type-checked.
#[cfg(not(feature = "logging"))]
macro_rules! log_discard {
    ($($arg:tt)*) => {{
        if false {
            let _ = ::std::format!($($arg)*);
        }
    }};
}

// --------------------
// WARN
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        tracing::warn!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::macros::log_discard!($($arg)*)
    };
}

// --------------------
// INFO
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_info {
    ($($arg:tt)*) => {
        tracing::info!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::macros::log_discard!($($arg)*)
    };
}

// --------------------
// DEBUG
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::macros::log_discard!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
pub(crate) use log_discard;

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
