use serde::{Deserialize, Serialize};

/// Modifier keys held during a row click. `toggle` is Ctrl on Linux/Windows and
/// Cmd on macOS; the shell decides which.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClickModifiers {
    #[serde(default)]
    pub toggle: bool,
    #[serde(default)]
    pub shift: bool,
}

impl ClickModifiers {
    pub const NONE: ClickModifiers = ClickModifiers {
        toggle: false,
        shift: false,
    };

    pub fn any(&self) -> bool {
        self.toggle || self.shift
    }
}

/// What a gesture resolves to before it touches the selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionAction {
    SelectSingle(String),
    Toggle(String),
    RangeSelect {
        ids: Vec<String>,
        anchor: Option<String>,
    },
    AddRange(Vec<String>),
}

/// Transient state of a mouse-drag selection. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DragSession {
    pub start_index: usize,
    extended: bool,
}

/// The inclusive slice of `ordered_ids` between two indices, in display order.
pub fn range_between(ordered_ids: &[String], a: usize, b: usize) -> Vec<String> {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    if ordered_ids.is_empty() {
        return Vec::new();
    }
    let hi = hi.min(ordered_ids.len() - 1);
    if lo > hi {
        return Vec::new();
    }
    ordered_ids[lo..=hi].to_vec()
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    /// Insertion-ordered; the last element is the most recently added.
    selected_ids: Vec<String>,
    primary_id: Option<String>,
    anchor_id: Option<String>,
    detail_open: bool,
    #[serde(skip)]
    drag: Option<DragSession>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selected_ids(&self) -> &[String] {
        &self.selected_ids
    }

    pub fn primary_id(&self) -> Option<&str> {
        self.primary_id.as_deref()
    }

    pub fn anchor_id(&self) -> Option<&str> {
        self.anchor_id.as_deref()
    }

    pub fn is_detail_open(&self) -> bool {
        self.detail_open
    }

    pub fn is_selected(&self, id: &str) -> bool {
        self.selected_ids.iter().any(|s| s == id)
    }

    pub fn is_empty(&self) -> bool {
        self.selected_ids.is_empty()
    }

    pub fn drag(&self) -> Option<&DragSession> {
        self.drag.as_ref()
    }

    // ---- Primitive operations ----

    pub fn select_single(&mut self, id: &str) {
        self.selected_ids = vec![id.to_string()];
        self.primary_id = Some(id.to_string());
        self.anchor_id = Some(id.to_string());
        self.detail_open = true;
    }

    pub fn toggle(&mut self, id: &str) {
        if let Some(pos) = self.selected_ids.iter().position(|s| s == id) {
            self.selected_ids.remove(pos);
            if self.primary_id.as_deref() == Some(id) {
                self.primary_id = self.selected_ids.last().cloned();
            }
        } else {
            self.selected_ids.push(id.to_string());
            self.primary_id = Some(id.to_string());
        }
        self.anchor_id = Some(id.to_string());
        self.detail_open = !self.selected_ids.is_empty();
    }

    /// Replace the selection with `ids`. The anchor only moves when one is given.
    pub fn range_select(&mut self, ids: &[String], new_anchor: Option<&str>) {
        let mut selected: Vec<String> = Vec::with_capacity(ids.len());
        for id in ids {
            if !selected.contains(id) {
                selected.push(id.clone());
            }
        }
        self.selected_ids = selected;
        self.primary_id = ids.last().cloned();
        if let Some(anchor) = new_anchor {
            self.anchor_id = Some(anchor.to_string());
        }
        self.detail_open = !self.selected_ids.is_empty();
    }

    pub fn add_range_to_selection(&mut self, ids: &[String]) {
        for id in ids {
            if !self.selected_ids.contains(id) {
                self.selected_ids.push(id.clone());
            }
        }
        if let Some(last) = ids.last() {
            self.primary_id = Some(last.clone());
        }
        self.detail_open = !self.selected_ids.is_empty();
    }

    pub fn clear(&mut self) {
        self.selected_ids.clear();
        self.primary_id = None;
        self.anchor_id = None;
        self.detail_open = false;
    }

    /// Drop ids that are no longer displayed, keeping the primary valid.
    pub fn retain_visible(&mut self, ordered_ids: &[String]) {
        self.selected_ids.retain(|id| ordered_ids.contains(id));
        let primary_gone = self
            .primary_id
            .as_ref()
            .map_or(false, |p| !self.selected_ids.contains(p));
        if primary_gone {
            self.primary_id = self.selected_ids.last().cloned();
        }
        self.detail_open = self.detail_open && !self.selected_ids.is_empty();
    }

    pub fn apply(&mut self, action: SelectionAction) {
        match action {
            SelectionAction::SelectSingle(id) => self.select_single(&id),
            SelectionAction::Toggle(id) => self.toggle(&id),
            SelectionAction::RangeSelect { ids, anchor } => {
                self.range_select(&ids, anchor.as_deref())
            }
            SelectionAction::AddRange(ids) => self.add_range_to_selection(&ids),
        }
    }

    // ---- Gestures ----

    fn anchor_index(&self, ordered_ids: &[String]) -> Option<usize> {
        let anchor = self.anchor_id.as_ref()?;
        ordered_ids.iter().position(|id| id == anchor)
    }

    /// Map a click on `id` to the action the table performs.
    pub fn resolve_click(
        &self,
        id: &str,
        modifiers: ClickModifiers,
        ordered_ids: &[String],
    ) -> SelectionAction {
        let anchor_range = || -> Option<Vec<String>> {
            let a = self.anchor_index(ordered_ids)?;
            let b = ordered_ids.iter().position(|row| row == id)?;
            Some(range_between(ordered_ids, a, b))
        };

        match (modifiers.toggle, modifiers.shift) {
            (true, true) => match anchor_range() {
                Some(range) => SelectionAction::AddRange(range),
                None => SelectionAction::Toggle(id.to_string()),
            },
            (false, true) => match anchor_range() {
                Some(range) => SelectionAction::RangeSelect {
                    ids: range,
                    anchor: None,
                },
                None => SelectionAction::SelectSingle(id.to_string()),
            },
            (true, false) => SelectionAction::Toggle(id.to_string()),
            (false, false) => {
                if self.selected_ids.len() == 1 && self.selected_ids[0] == id {
                    SelectionAction::Toggle(id.to_string())
                } else {
                    SelectionAction::SelectSingle(id.to_string())
                }
            }
        }
    }

    pub fn handle_click(&mut self, id: &str, modifiers: ClickModifiers, ordered_ids: &[String]) {
        let action = self.resolve_click(id, modifiers, ordered_ids);
        self.apply(action);
    }

    /// Select every displayed row, anchored at the first.
    pub fn select_all(&mut self, ordered_ids: &[String]) {
        let anchor = ordered_ids.first().cloned();
        self.range_select(ordered_ids, anchor.as_deref());
    }

    // ---- Drag ----

    pub fn pointer_down(&mut self, index: usize, modifiers: ClickModifiers) {
        if modifiers.any() {
            return;
        }
        self.drag = Some(DragSession {
            start_index: index,
            extended: false,
        });
    }

    pub fn pointer_enter(&mut self, index: usize, ordered_ids: &[String]) {
        let Some(mut drag) = self.drag else {
            return;
        };
        if index >= ordered_ids.len() || drag.start_index >= ordered_ids.len() {
            return;
        }
        if index == drag.start_index && !drag.extended {
            return;
        }
        let range = range_between(ordered_ids, drag.start_index, index);
        let anchor = if drag.extended {
            None
        } else {
            Some(ordered_ids[drag.start_index].clone())
        };
        drag.extended = true;
        self.drag = Some(drag);
        self.range_select(&range, anchor.as_deref());
    }

    /// Global pointer-up. Returns true when the drag covered more than its
    /// starting row, so the trailing click should be ignored.
    pub fn pointer_up(&mut self) -> bool {
        self.drag.take().map_or(false, |drag| drag.extended)
    }
}
