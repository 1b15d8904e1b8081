//! Composable sub-stores.
//!
//! A slice is an independently owned sub-tree of the root with its own
//! action enum. The root reducer routes each action to its owning slice
//! with [`reduce_slice`], which hands back the same `Arc` when the slice
//! reports no change so the container can skip notification.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// A slice's action vocabulary.
pub trait SliceAction: Clone + fmt::Debug + Serialize + Send + Sync + 'static {
    /// Name of the reducer this action targets, e.g. `"setTheme"`.
    fn reducer_name(&self) -> &'static str;
}

/// An independently defined sub-tree of the root state.
pub trait Slice: Clone + fmt::Debug + Send + Sync + 'static {
    /// Slice name, used as the action namespace.
    const NAME: &'static str;

    type Action: SliceAction;

    /// Initial value of this slice.
    fn initial() -> Self;

    /// Apply an action. `None` means the slice is unchanged.
    fn reduce(&self, action: &Self::Action) -> Option<Self>;
}

/// Namespaced action type: `"<slice>/<reducer>"`.
pub fn action_type<S: Slice>(action: &S::Action) -> String {
    format!("{}/{}", S::NAME, action.reducer_name())
}

/// Run a slice reducer, preserving identity when nothing changed.
pub fn reduce_slice<S: Slice>(slice: &Arc<S>, action: &S::Action) -> Arc<S> {
    match slice.reduce(action) {
        Some(next) => Arc::new(next),
        None => slice.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Flags {
        dark: bool,
    }

    #[derive(Debug, Clone, Serialize)]
    enum FlagsAction {
        SetDark(bool),
    }

    impl SliceAction for FlagsAction {
        fn reducer_name(&self) -> &'static str {
            match self {
                FlagsAction::SetDark(_) => "setDark",
            }
        }
    }

    impl Slice for Flags {
        const NAME: &'static str = "flags";
        type Action = FlagsAction;

        fn initial() -> Self {
            Flags { dark: false }
        }

        fn reduce(&self, action: &FlagsAction) -> Option<Self> {
            match action {
                FlagsAction::SetDark(dark) if *dark == self.dark => None,
                FlagsAction::SetDark(dark) => Some(Flags { dark: *dark }),
            }
        }
    }

    #[test]
    fn test_action_type_is_namespaced() {
        assert_eq!(action_type::<Flags>(&FlagsAction::SetDark(true)), "flags/setDark");
    }

    #[test]
    fn test_reduce_slice_keeps_identity_on_noop() {
        let slice = Arc::new(Flags::initial());
        let same = reduce_slice(&slice, &FlagsAction::SetDark(false));
        assert!(Arc::ptr_eq(&slice, &same));

        let changed = reduce_slice(&slice, &FlagsAction::SetDark(true));
        assert!(!Arc::ptr_eq(&slice, &changed));
        assert!(changed.dark);
    }
}
