/// Persisted lifecycle state of a target index, as seen by the builder.
/// Transitions happen only inside the store's own transactions: the builder
/// may write `Disabled -> WriteOnly` and `WriteOnly -> Readable`, and never
/// writes out of `Readable`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub enum IndexLifecycle {
    Disabled,
    WriteOnly,
    Readable,
    Corrupt,
}

impl std::fmt::Display for IndexLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disabled => "disabled",
            Self::WriteOnly => "write_only",
            Self::Readable => "readable",
            Self::Corrupt => "corrupt",
        };
        f.write_str(s)
    }
}
