//! Logging interface, contingent on the `log` and `defmt-03` features
//!
//! Everything compiles to nothing when neither feature is enabled. Only
//! enable logging when you're certain that your logger isn't using the
//! same USB bus!
//!
//! Keep the arguments to integers and strings, and the placeholders to
//! `{}`, so that the same format string works for both backends.

macro_rules! trace {
    ($($args:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::trace!($($args)*);
        #[cfg(feature = "defmt-03")]
        ::defmt::trace!($($args)*);
    }};
}

macro_rules! debug {
    ($($args:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::debug!($($args)*);
        #[cfg(feature = "defmt-03")]
        ::defmt::debug!($($args)*);
    }};
}

macro_rules! warn {
    ($($args:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::warn!($($args)*);
        #[cfg(feature = "defmt-03")]
        ::defmt::warn!($($args)*);
    }};
}

macro_rules! error {
    ($($args:tt)*) => {{
        #[cfg(feature = "log")]
        ::log::error!($($args)*);
        #[cfg(feature = "defmt-03")]
        ::defmt::error!($($args)*);
    }};
}
