#![allow(unused_macros)]

#[cfg(feature = "defmt-logging")]
macro_rules! nr_log {
    (trace,   $($arg:expr),*) => { defmt::trace!($($arg),*) };
    (debug,   $($arg:expr),*) => { defmt::debug!($($arg),*) };
    (info,    $($arg:expr),*) => { defmt::info!($($arg),*) };
    (warn,    $($arg:expr),*) => { defmt::warn!($($arg),*) };
    (error,   $($arg:expr),*) => { defmt::error!($($arg),*) };
    (println, $($arg:expr),*) => { defmt::println!($($arg),*) };
}

#[cfg(not(feature = "defmt-logging"))]
macro_rules! nr_log {
    ($level:ident, $($arg:expr),*) => {{ $( let _ = $arg; )* }}
}

macro_rules! nr_trace {
    ($($arg:expr),*) => (nr_log!(trace, $($arg),*));
}

macro_rules! nr_debug {
    ($($arg:expr),*) => (nr_log!(debug, $($arg),*));
}

macro_rules! nr_info {
    ($($arg:expr),*) => (nr_log!(info, $($arg),*));
}

macro_rules! nr_warn {
    ($($arg:expr),*) => (nr_log!(warn, $($arg),*));
}

macro_rules! nr_error {
    ($($arg:expr),*) => (nr_log!(error, $($arg),*));
}

macro_rules! nr_println {
    ($($arg:expr),*) => (nr_log!(println, $($arg),*));
}
