//! Declarative helpers shared across the crate.

/// Declares the numeric error codes a device may return in a JSON-RPC
/// `error` object, together with a short description of each.
///
/// Expands to one `pub const` per code plus a `code_description` lookup.
macro_rules! define_error_codes {
    ($($name:ident = $code:expr => $desc:expr),* $(,)?) => {
        $(
            #[doc = $desc]
            pub const $name: i64 = $code;
        )*

        /// Returns the description of a known device error code.
        pub fn code_description(code: i64) -> Option<&'static str> {
            match code {
                $(c if c == $name => Some($desc),)*
                _ => None,
            }
        }
    };
}
