use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// A one-shot cleanup action: unsubscribes a listener, removes a registration, etc.
/// Disposing twice is a no-op; dropping without disposing leaves the registration in place.
#[must_use]
pub struct Disposable(Option<Box<dyn FnOnce()>>);

impl Disposable {
    pub fn new(action: impl FnOnce() + 'static) -> Self {
        Disposable(Some(Box::new(action)))
    }

    /// A disposable that does nothing.
    pub fn inert() -> Self {
        Disposable(None)
    }

    pub fn dispose(&mut self) {
        if let Some(action) = self.0.take() {
            action();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.0.is_none()
    }
}

type Listener<T> = Rc<dyn Fn(&T)>;

struct Listeners<T> {
    entries: RefCell<Vec<(u64, Listener<T>)>>,
    next_id: Cell<u64>,
}

/// Synchronous fan-out: `fire` invokes every listener in subscription order before returning.
pub struct EventEmitter<T> {
    listeners: Rc<Listeners<T>>,
}

impl<T: 'static> EventEmitter<T> {
    pub fn new() -> Self {
        EventEmitter {
            listeners: Rc::new(Listeners {
                entries: RefCell::new(Vec::new()),
                next_id: Cell::new(0),
            }),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&T) + 'static) -> Disposable {
        let id = self.listeners.next_id.get();
        self.listeners.next_id.set(id + 1);
        self.listeners.entries.borrow_mut().push((id, Rc::new(listener)));

        let listeners: Weak<Listeners<T>> = Rc::downgrade(&self.listeners);
        Disposable::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.entries.borrow_mut().retain(|(entry_id, _)| *entry_id != id);
            }
        })
    }

    pub fn fire(&self, event: &T) {
        // Listeners may subscribe, unsubscribe or fire again while we iterate.
        let snapshot: Vec<Listener<T>> =
            self.listeners.entries.borrow().iter().map(|(_, listener)| listener.clone()).collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.entries.borrow().len()
    }

    pub fn clear(&self) {
        self.listeners.entries.borrow_mut().clear();
    }
}

impl<T: 'static> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_subscription_order() {
        let emitter = EventEmitter::<u32>::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let log1 = log.clone();
        let _first = emitter.subscribe(move |e| log1.borrow_mut().push(("first", *e)));
        let log2 = log.clone();
        let _second = emitter.subscribe(move |e| log2.borrow_mut().push(("second", *e)));

        emitter.fire(&1);
        emitter.fire(&2);
        assert_eq!(
            *log.borrow(),
            vec![("first", 1), ("second", 1), ("first", 2), ("second", 2)]
        );
    }

    #[test]
    fn dispose_unsubscribes_once() {
        let emitter = EventEmitter::<u32>::new();
        let count = Rc::new(Cell::new(0));
        let count2 = count.clone();
        let mut subscription = emitter.subscribe(move |_| count2.set(count2.get() + 1));

        emitter.fire(&0);
        subscription.dispose();
        assert!(subscription.is_disposed());
        subscription.dispose();
        emitter.fire(&0);
        assert_eq!(count.get(), 1);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn reentrant_subscribe() {
        let emitter = Rc::new(EventEmitter::<u32>::new());
        let inner = Rc::downgrade(&emitter);
        let _subscription = emitter.subscribe(move |_| {
            if let Some(emitter) = inner.upgrade() {
                let _inner = emitter.subscribe(|_| {});
            }
        });
        emitter.fire(&0);
        assert_eq!(emitter.listener_count(), 2);
    }

    #[test]
    fn inert_disposable() {
        let mut disposable = Disposable::inert();
        assert!(disposable.is_disposed());
        disposable.dispose();
    }
}
