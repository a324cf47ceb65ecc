use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};

use crate::domain::ItemId;

/// One selection mutation, with the ids it actually changed, sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionEvent {
    Selected(Vec<ItemId>),
    Deselected(Vec<ItemId>),
}

/// The single source of truth for highlighted items.
///
/// Table-facing and map-facing collaborators call the same mutation
/// operations and subscribe to the same event stream; neither keeps its own
/// selection copy. Notification fan-out happens under the model lock, so
/// every observer sees every mutation in application order, fully delivered
/// before the next mutation starts.
///
/// Membership is bounded by the *universe*: the id set of the most recent
/// search result. Mutations on ids outside it are ignored, and installing a
/// new universe prunes the selection to the intersection.
pub struct SelectionModel {
    inner: Mutex<Inner>,
}

struct Inner {
    universe: BTreeSet<ItemId>,
    current: BTreeSet<ItemId>,
    observers: Vec<Sender<SelectionEvent>>,
}

impl SelectionModel {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                universe: BTreeSet::new(),
                current: BTreeSet::new(),
                observers: Vec::new(),
            }),
        }
    }

    pub fn subscribe(&self) -> Receiver<SelectionEvent> {
        let (tx, rx) = mpsc::channel();
        self.inner.lock().unwrap().observers.push(tx);
        rx
    }

    /// Replaces the working set after a search. Selected ids that fell out
    /// of the new result set are pruned and announced as deselected.
    pub fn set_universe<I>(&self, ids: I)
    where
        I: IntoIterator<Item = ItemId>,
    {
        let mut inner = self.inner.lock().unwrap();
        inner.universe = ids.into_iter().collect();
        let removed: Vec<ItemId> = inner
            .current
            .iter()
            .filter(|id| !inner.universe.contains(*id))
            .cloned()
            .collect();
        if removed.is_empty() {
            return;
        }
        for id in &removed {
            inner.current.remove(id);
        }
        inner.emit(SelectionEvent::Deselected(removed));
    }

    /// Adds ids to the selection. Already-selected and out-of-universe ids
    /// are dropped silently; if nothing actually changes, no event fires.
    pub fn select<I>(&self, ids: I)
    where
        I: IntoIterator<Item = ItemId>,
    {
        let mut inner = self.inner.lock().unwrap();
        let added: Vec<ItemId> = ids
            .into_iter()
            .filter(|id| inner.universe.contains(id) && !inner.current.contains(id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if added.is_empty() {
            return;
        }
        for id in &added {
            inner.current.insert(id.clone());
        }
        inner.emit(SelectionEvent::Selected(added));
    }

    /// Flips one id regardless of origin; no-op outside the universe.
    pub fn toggle(&self, id: &ItemId) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.universe.contains(id) {
            return;
        }
        if inner.current.remove(id) {
            inner.emit(SelectionEvent::Deselected(vec![id.clone()]));
        } else {
            inner.current.insert(id.clone());
            inner.emit(SelectionEvent::Selected(vec![id.clone()]));
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.current.is_empty() {
            return;
        }
        let removed: Vec<ItemId> = inner.current.iter().cloned().collect();
        inner.current.clear();
        inner.emit(SelectionEvent::Deselected(removed));
    }

    pub fn current(&self) -> BTreeSet<ItemId> {
        self.inner.lock().unwrap().current.clone()
    }

    pub fn is_selected(&self, id: &ItemId) -> bool {
        self.inner.lock().unwrap().current.contains(id)
    }
}

impl Default for SelectionModel {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn emit(&mut self, event: SelectionEvent) {
        self.observers
            .retain(|observer| observer.send(event.clone()).is_ok());
    }
}
