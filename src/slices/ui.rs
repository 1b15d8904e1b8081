//! View preferences shared across pages.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::slice::{Slice, SliceAction};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

/// The entity currently open in the detail pane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub entity: String,
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UiState {
    pub theme: Theme,
    pub sidebar_collapsed: bool,
    /// Active list filter per entity namespace.
    #[serde(default)]
    pub filters: BTreeMap<String, Value>,
    pub selected: Option<Selection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum UiAction {
    SetTheme(Theme),
    ToggleSidebar,
    SetFilter { entity: String, filter: Value },
    ClearFilter { entity: String },
    Select(Option<Selection>),
}

impl SliceAction for UiAction {
    fn reducer_name(&self) -> &'static str {
        match self {
            UiAction::SetTheme(_) => "setTheme",
            UiAction::ToggleSidebar => "toggleSidebar",
            UiAction::SetFilter { .. } => "setFilter",
            UiAction::ClearFilter { .. } => "clearFilter",
            UiAction::Select(_) => "select",
        }
    }
}

impl Slice for UiState {
    const NAME: &'static str = "ui";
    type Action = UiAction;

    fn initial() -> Self {
        Self::default()
    }

    fn reduce(&self, action: &UiAction) -> Option<Self> {
        match action {
            UiAction::SetTheme(theme) if *theme == self.theme => None,
            UiAction::SetTheme(theme) => Some(UiState {
                theme: *theme,
                ..self.clone()
            }),
            UiAction::ToggleSidebar => Some(UiState {
                sidebar_collapsed: !self.sidebar_collapsed,
                ..self.clone()
            }),
            UiAction::SetFilter { entity, filter } => {
                if self.filters.get(entity) == Some(filter) {
                    return None;
                }
                let mut next = self.clone();
                next.filters.insert(entity.clone(), filter.clone());
                Some(next)
            }
            UiAction::ClearFilter { entity } => {
                if !self.filters.contains_key(entity) {
                    return None;
                }
                let mut next = self.clone();
                next.filters.remove(entity);
                Some(next)
            }
            UiAction::Select(selection) if *selection == self.selected => None,
            UiAction::Select(selection) => Some(UiState {
                selected: selection.clone(),
                ..self.clone()
            }),
        }
    }
}
