/// Generates an enum over a BACnet enumeration that reserves part of its
/// numeric range for vendor-proprietary values.
///
/// Several BACnet enumerations (error codes, error classes, and the like)
/// enumerate standard values in a low range and hand everything inside a
/// defined window to vendors. This macro generates the named variants plus
/// a `Proprietary` variant for in-range unknown values and a `Reserved`
/// variant for out-of-range unknown values, so decoding arbitrary wire
/// values is total and re-encoding is lossless.
///
/// # Arguments
///
/// * `$name:ident` - The name of the enum to be generated.
/// * `$variant:ident = $value:expr` - Named variants and their wire values.
/// * `$unit:ident` - The underlying integer type (e.g. `u16`).
/// * `$range:expr` - The vendor-proprietary range (e.g. `256..=65535`).
///
/// # Example
///
/// ```rust
/// use bacnet_sc::vendor_range_enum;
///
/// vendor_range_enum! {
///     SampleCode {
///         Success = 0,
///         HeaderEncodingError = 181,
///     },
///     u16,
///     256..=65535
/// }
///
/// assert_eq!(SampleCode::from(0u16), SampleCode::Success);
/// assert_eq!(u16::from(SampleCode::HeaderEncodingError), 181);
///
/// let vendor = SampleCode::from(1000u16);
/// assert!(matches!(vendor, SampleCode::Proprietary(_)));
/// assert_eq!(u16::from(vendor), 1000);
///
/// let reserved = SampleCode::from(200u16);
/// assert!(matches!(reserved, SampleCode::Reserved(_)));
/// assert_eq!(format!("{}", reserved), "Reserved(200)");
/// ```
#[macro_export]
macro_rules! vendor_range_enum {
    ($(#[$doc:meta])* $name:ident { $($variant:ident = $value:expr,)+ }, $unit:ident, $vendor_range:expr) => {
        pastey::paste! {
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub enum $name {
                $($variant,)*
                /// Unknown value inside the vendor-proprietary range.
                Proprietary([<$name Raw>]),
                /// Unknown value outside the vendor-proprietary range.
                Reserved([<$name Raw>]),
            }

            /// Raw wire value carried by unknown variants of the
            /// surrounding enumeration.
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct [<$name Raw>]($unit);

            impl [<$name Raw>] {
                pub fn value(&self) -> $unit {
                    self.0
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    match self {
                        $($name::$variant => write!(f, "{}", stringify!($variant)),)*
                        $name::Proprietary(raw) => write!(f, "Proprietary({})", raw.value()),
                        $name::Reserved(raw) => write!(f, "Reserved({})", raw.value()),
                    }
                }
            }

            impl From<$name> for $unit {
                fn from(value: $name) -> Self {
                    match value {
                        $($name::$variant => $value,)*
                        $name::Proprietary(raw) => raw.value(),
                        $name::Reserved(raw) => raw.value(),
                    }
                }
            }

            impl From<$unit> for $name {
                fn from(value: $unit) -> Self {
                    match value {
                        $($value => $name::$variant,)*
                        v if ($vendor_range).contains(&v) => {
                            $name::Proprietary([<$name Raw>](v))
                        }
                        v => $name::Reserved([<$name Raw>](v)),
                    }
                }
            }
        }
    };
}
