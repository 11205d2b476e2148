#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]

mod err;
mod load;

pub use err::{ConfigBuildError, ConfigError};
pub use load::load_builder;

#[doc(hidden)]
pub use paste;

/// Implement `builder()` and `Default` for a configuration type with a
/// `derive_builder` builder whose error type is [`ConfigBuildError`].
///
/// `Default` is implemented by building an empty builder, so every field
/// must have a builder default.  Use the `: !Default` form for types with
/// mandatory fields.
///
/// A test is generated alongside, checking that the default builds.
#[macro_export]
macro_rules! impl_standard_builder {
    { $config:ident } => {
        $crate::impl_standard_builder! { @builder $config }

        impl Default for $config {
            fn default() -> Self {
                // All fields have builder defaults; this can only fail if
                // the defaults themselves are inconsistent.
                $crate::paste::paste! {
                    [< $config Builder >]::default()
                        .build()
                        .expect("default configuration failed to build")
                }
            }
        }

        $crate::paste::paste! {
            #[cfg(test)]
            #[allow(non_snake_case)]
            #[test]
            fn [< test_default_builds_ $config >]() {
                let _ = $config::default();
            }
        }
    };
    { $config:ident : !Default } => {
        $crate::impl_standard_builder! { @builder $config }
    };
    { @builder $config:ident } => {
        $crate::paste::paste! {
            impl $config {
                /// Return a new builder for this configuration.
                pub fn builder() -> [< $config Builder >] {
                    Default::default()
                }
            }
        }
    };
}
