// File: src/store.rs
// The client-visible event list and the delta operations that mutate it.
use crate::model::CalendarEvent;
use std::collections::{HashMap, HashSet};

/// Events grouped per owning calendar, with an id -> calendar index.
///
/// Fields are private: the add/update/delete/bulk operations below are the
/// only way to mutate the list. Every mutator returns whether the visible
/// content changed so callers can coalesce "view changed" signals.
#[derive(Debug, Clone, Default)]
pub struct EventList {
    calendars: HashMap<String, Vec<CalendarEvent>>,
    index: HashMap<String, String>,
}

impl EventList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&CalendarEvent> {
        let owner = self.index.get(id)?;
        self.calendars.get(owner)?.iter().find(|e| e.id == id)
    }

    pub fn events_for(&self, calendar_id: &str) -> &[CalendarEvent] {
        self.calendars
            .get(calendar_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Appends the event, or replaces it when the id is already present.
    ///
    /// Duplicate add notifications therefore converge on the same list.
    pub fn apply_add(&mut self, event: CalendarEvent) -> bool {
        if self.index.contains_key(&event.id) {
            return self.apply_update(event);
        }
        self.index.insert(event.id.clone(), event.calendar_id.clone());
        self.calendars
            .entry(event.calendar_id.clone())
            .or_default()
            .push(event);
        true
    }

    /// Replaces the entry with the same id. Unknown ids are ignored: an update
    /// can outrun its add during a reconnect window.
    pub fn apply_update(&mut self, event: CalendarEvent) -> bool {
        let Some(owner) = self.index.get(&event.id).cloned() else {
            return false;
        };

        if owner != event.calendar_id {
            // The event changed owner; drop the old copy and re-add under the new one.
            self.remove_from(&owner, &event.id);
            self.index.insert(event.id.clone(), event.calendar_id.clone());
            self.calendars
                .entry(event.calendar_id.clone())
                .or_default()
                .push(event);
            return true;
        }

        if let Some(list) = self.calendars.get_mut(&owner)
            && let Some(slot) = list.iter_mut().find(|e| e.id == event.id)
        {
            if *slot == event {
                return false;
            }
            *slot = event;
            return true;
        }

        // Index pointed at a missing entry; repair it.
        self.index.remove(&event.id);
        false
    }

    pub fn apply_delete(&mut self, id: &str) -> bool {
        let Some(owner) = self.index.remove(id) else {
            return false;
        };
        self.remove_from(&owner, id)
    }

    /// Merges a freshly fetched batch without discarding entries that arrived
    /// by notification before the fetch completed.
    pub fn bulk_add(&mut self, calendar_id: &str, events: Vec<CalendarEvent>) -> bool {
        let mut changed = false;
        for mut event in events {
            event.calendar_id = calendar_id.to_string();
            changed |= self.apply_add(event);
        }
        changed
    }

    /// Replaces everything owned by `calendar_id` with `events`.
    pub fn bulk_replace(&mut self, calendar_id: &str, events: Vec<CalendarEvent>) -> bool {
        let previous = self.calendars.remove(calendar_id).unwrap_or_default();
        for old in &previous {
            self.index.remove(&old.id);
        }

        for mut event in events {
            event.calendar_id = calendar_id.to_string();
            self.apply_add(event);
        }

        previous.as_slice() != self.events_for(calendar_id)
    }

    /// Like [`bulk_add`](Self::bulk_add), for a batch requested before the
    /// notifications in `notified` were applied. Those ids keep their
    /// notification-side state.
    pub fn bulk_add_after(
        &mut self,
        calendar_id: &str,
        events: Vec<CalendarEvent>,
        notified: &NotifiedIds,
    ) -> bool {
        self.bulk_add(calendar_id, notified.without_notified(events))
    }

    /// Like [`bulk_replace`](Self::bulk_replace), for a batch requested before
    /// the notifications in `notified` were applied. Deleted ids stay deleted
    /// and events added or updated by notification are kept as they are.
    pub fn bulk_replace_after(
        &mut self,
        calendar_id: &str,
        events: Vec<CalendarEvent>,
        notified: &NotifiedIds,
    ) -> bool {
        if notified.is_empty() {
            return self.bulk_replace(calendar_id, events);
        }
        let previous = self.events_for(calendar_id).to_vec();
        let mut batch = notified.without_notified(events);
        batch.extend(
            previous
                .iter()
                .filter(|e| notified.touched.contains(&e.id))
                .cloned(),
        );
        self.bulk_replace(calendar_id, batch);
        !same_events(&previous, self.events_for(calendar_id))
    }

    /// Removes every event owned by `calendar_id`, returning how many were dropped.
    pub fn purge_calendar(&mut self, calendar_id: &str) -> usize {
        let removed = self.calendars.remove(calendar_id).unwrap_or_default();
        for event in &removed {
            self.index.remove(&event.id);
        }
        removed.len()
    }

    /// Ordered copy for the rendering surface: by start time, then id.
    pub fn snapshot(&self) -> Vec<CalendarEvent> {
        let mut all: Vec<CalendarEvent> = self.calendars.values().flatten().cloned().collect();
        all.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
        all
    }

    fn remove_from(&mut self, calendar_id: &str, id: &str) -> bool {
        if let Some(list) = self.calendars.get_mut(calendar_id)
            && let Some(pos) = list.iter().position(|e| e.id == id)
        {
            list.remove(pos);
            if list.is_empty() {
                self.calendars.remove(calendar_id);
            }
            return true;
        }
        false
    }
}

fn same_events(a: &[CalendarEvent], b: &[CalendarEvent]) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.iter().any(|y| x == y))
}

/// Event ids that notifications changed while a fetch was in flight.
#[derive(Debug, Clone, Default)]
pub struct NotifiedIds {
    touched: HashSet<String>,
    deleted: HashSet<String>,
}

impl NotifiedIds {
    pub fn is_empty(&self) -> bool {
        self.touched.is_empty() && self.deleted.is_empty()
    }

    /// Records an add or update.
    pub fn touch(&mut self, id: &str) {
        self.deleted.remove(id);
        self.touched.insert(id.to_string());
    }

    /// Records a delete.
    pub fn tombstone(&mut self, id: &str) {
        self.touched.remove(id);
        self.deleted.insert(id.to_string());
    }

    fn without_notified(&self, events: Vec<CalendarEvent>) -> Vec<CalendarEvent> {
        events
            .into_iter()
            .filter(|e| !self.touched.contains(&e.id) && !self.deleted.contains(&e.id))
            .collect()
    }
}
