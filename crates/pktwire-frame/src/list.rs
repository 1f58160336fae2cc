use std::collections::VecDeque;

/// Frames waiting to go out, ordered by priority (lower value sooner).
///
/// The head is the frame currently being written and never moves. New items
/// go in front of the first later item with a strictly greater priority
/// value, so equal priorities stay FIFO.
#[derive(Debug)]
pub struct PriorityList<T> {
    items: VecDeque<(u8, T)>,
}

impl<T> Default for PriorityList<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }
}

impl<T> PriorityList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, priority: u8, item: T) {
        let position = self
            .items
            .iter()
            .skip(1)
            .position(|(p, _)| *p > priority)
            .map(|index| index + 1);
        match position {
            Some(index) => self.items.insert(index, (priority, item)),
            None => self.items.push_back((priority, item)),
        }
    }

    pub fn head(&self) -> Option<&T> {
        self.items.front().map(|(_, item)| item)
    }

    pub fn head_mut(&mut self) -> Option<&mut T> {
        self.items.front_mut().map(|(_, item)| item)
    }

    pub fn pop_head(&mut self) -> Option<T> {
        self.items.pop_front().map(|(_, item)| item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter().map(|(_, item)| item)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.iter_mut().map(|(_, item)| item)
    }

    /// Index of the first item matching `pred`.
    pub fn position(&self, pred: impl FnMut(&T) -> bool) -> Option<usize> {
        let mut pred = pred;
        self.items.iter().position(|(_, item)| pred(item))
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.items.get_mut(index).map(|(_, item)| item)
    }

    pub fn remove(&mut self, index: usize) -> Option<T> {
        self.items.remove(index).map(|(_, item)| item)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.items.drain(..).map(|(_, item)| item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(list: &PriorityList<&'static str>) -> Vec<&'static str> {
        list.iter().copied().collect()
    }

    #[test]
    fn equal_priorities_stay_fifo() {
        let mut list = PriorityList::new();
        list.push(1, "a");
        list.push(1, "b");
        list.push(1, "c");
        assert_eq!(order(&list), ["a", "b", "c"]);
    }

    #[test]
    fn control_jumps_data_but_not_earlier_control() {
        let mut list = PriorityList::new();
        list.push(1, "entity-a");
        list.push(1, "entity-b");
        list.push(0, "cancel-1");
        list.push(0, "heartbeat");
        list.push(1, "entity-c");
        assert_eq!(
            order(&list),
            ["entity-a", "cancel-1", "heartbeat", "entity-b", "entity-c"]
        );
    }

    #[test]
    fn head_is_pinned() {
        let mut list = PriorityList::new();
        list.push(1, "in-flight");
        list.push(0, "urgent");
        assert_eq!(list.head(), Some(&"in-flight"));
        assert_eq!(list.pop_head(), Some("in-flight"));
        assert_eq!(list.head(), Some(&"urgent"));
    }

    #[test]
    fn remove_by_position() {
        let mut list = PriorityList::new();
        list.push(1, "a");
        list.push(1, "b");
        let index = list.position(|item| *item == "b").unwrap();
        assert_eq!(list.remove(index), Some("b"));
        assert_eq!(list.len(), 1);
        assert_eq!(list.drain().collect::<Vec<_>>(), ["a"]);
        assert!(list.is_empty());
    }
}
