/// Generates `as_str`, `parse_str` and `Display` for a fieldless enum whose
/// wire form is a fixed string.
///
/// ```ignore
/// enum_str! {
///     SessionStatus {
///         Created => ["CREATED", "created"],
///         Closed => ["CLOSED"],
///     }
/// }
/// ```
///
/// The first string of each variant is canonical; the rest are accepted
/// aliases when parsing.
macro_rules! enum_str {
    (
        $name:ident {
            $($variant:ident => [$canonical:literal $(, $alias:literal)*]),+ $(,)?
        }
    ) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $canonical,)+
                }
            }

            pub fn parse_str(raw: &str) -> Option<Self> {
                match raw {
                    $($canonical $(| $alias)* => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}
