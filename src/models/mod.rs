/// Declares an integer bitfield stored in a `flags` column.
macro_rules! flag_set {
    ($name:ident { $($flag:ident = $bit:expr),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            $(pub const $flag: i64 = $bit;)+

            pub fn contains(self, flag: i64) -> bool {
                self.0 & flag == flag
            }

            pub fn set(&mut self, flag: i64, value: bool) {
                if value {
                    self.0 |= flag;
                } else {
                    self.0 &= !flag;
                }
            }

            pub fn with(mut self, flag: i64) -> Self {
                self.set(flag, true);
                self
            }
        }
    };
}

mod file;
mod post;
mod source;
mod subscription;
mod tag;

pub use file::{File, FileFlags, NewFile};
pub use post::{PostFlags, PostKind, Related, RemotePost};
pub use source::{Plugin, Source};
pub use subscription::{
    CursorState, FeedEntry, NewSubscription, SortKey, Subscription, SubscriptionFlags,
};
pub use tag::{RemoteTag, TagCategory, TagFlags};

/// Untyped JSON object used for adapter configuration, state and metadata blobs.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_toggle_independently() {
        let mut flags = FileFlags::default().with(FileFlags::PRESENT);
        flags.set(FileFlags::FAVORITE, true);
        assert!(flags.contains(FileFlags::PRESENT));
        assert!(flags.contains(FileFlags::FAVORITE));

        flags.set(FileFlags::PRESENT, false);
        assert!(!flags.contains(FileFlags::PRESENT));
        assert!(flags.contains(FileFlags::FAVORITE));
        assert_eq!(flags.0, FileFlags::FAVORITE);
    }
}
