//! Connection-state change fan-out.
//!
//! Callback dispatch walks the list by index with the lock dropped around
//! each invocation, so a callback may unregister itself or any other
//! callback mid-dispatch without skipping or double-invoking entries.

use std::sync::{Arc, Mutex};

/// Externally visible state of the connection carrying a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

pub type ConnectionStateCallback = Box<dyn FnMut(ConnectionState, ConnectionState) + Send>;

pub type NotifierToken = u64;

struct State {
    next_token: NotifierToken,
    callbacks: Vec<(NotifierToken, Arc<Mutex<ConnectionStateCallback>>)>,
    /// Index of the entry currently being dispatched. -1 means the current
    /// entry was removed out from under the walk.
    iter_index: Option<isize>,
}

pub struct ConnectionStateNotifier {
    state: Mutex<State>,
}

impl Default for ConnectionStateNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateNotifier {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_token: 1,
                callbacks: Vec::new(),
                iter_index: None,
            }),
        }
    }

    pub fn register(&self, callback: ConnectionStateCallback) -> NotifierToken {
        let mut state = self.state.lock().unwrap();
        let token = state.next_token;
        state.next_token += 1;
        state.callbacks.push((token, Arc::new(Mutex::new(callback))));
        token
    }

    /// Remove a callback. Safe to call from inside a dispatched callback.
    pub fn unregister(&self, token: NotifierToken) {
        let mut state = self.state.lock().unwrap();
        let Some(pos) = state.callbacks.iter().position(|(t, _)| *t == token) else {
            return;
        };
        state.callbacks.remove(pos);
        // Keep an in-progress walk aligned when the current entry or an
        // earlier one disappears.
        if let Some(index) = state.iter_index.as_mut()
            && pos as isize <= *index
        {
            *index -= 1;
        }
    }

    pub fn invoke_callbacks(&self, old_state: ConnectionState, new_state: ConnectionState) {
        let mut index = 0isize;
        loop {
            let callback = {
                let mut state = self.state.lock().unwrap();
                if index as usize >= state.callbacks.len() {
                    state.iter_index = None;
                    return;
                }
                state.iter_index = Some(index);
                Arc::clone(&state.callbacks[index as usize].1)
            };

            (callback.lock().unwrap())(old_state, new_state);

            let mut state = self.state.lock().unwrap();
            // Unregistration may have pulled the cursor back.
            index = state.iter_index.take().unwrap_or(index) + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_callbacks_invoked_in_registration_order() {
        let notifier = ConnectionStateNotifier::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            let sink = Arc::clone(&order);
            notifier.register(Box::new(move |_, _| sink.lock().unwrap().push(tag)));
        }
        notifier.invoke_callbacks(ConnectionState::Disconnected, ConnectionState::Connecting);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn callback_receives_transition() {
        let notifier = ConnectionStateNotifier::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        notifier.register(Box::new(move |old, new| {
            *sink.lock().unwrap() = Some((old, new));
        }));
        notifier.invoke_callbacks(ConnectionState::Connecting, ConnectionState::Connected);
        assert_eq!(
            *seen.lock().unwrap(),
            Some((ConnectionState::Connecting, ConnectionState::Connected))
        );
    }

    #[test]
    fn callback_can_unregister_itself() {
        let notifier = Arc::new(ConnectionStateNotifier::new());
        let hits = Arc::new(Mutex::new(0));

        let notifier_handle = Arc::clone(&notifier);
        let token_slot = Arc::new(Mutex::new(0));
        let slot = Arc::clone(&token_slot);
        let counter = Arc::clone(&hits);
        let token = notifier.register(Box::new(move |_, _| {
            *counter.lock().unwrap() += 1;
            notifier_handle.unregister(*slot.lock().unwrap());
        }));
        *token_slot.lock().unwrap() = token;

        notifier.invoke_callbacks(ConnectionState::Disconnected, ConnectionState::Connecting);
        notifier.invoke_callbacks(ConnectionState::Connecting, ConnectionState::Connected);
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn callback_unregistering_a_later_one_does_not_skip_others() {
        let notifier = Arc::new(ConnectionStateNotifier::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let sink_a = Arc::clone(&order);
        let notifier_handle = Arc::clone(&notifier);
        let b_token_slot = Arc::new(Mutex::new(0));
        let b_slot = Arc::clone(&b_token_slot);
        notifier.register(Box::new(move |_, _| {
            sink_a.lock().unwrap().push("a");
            notifier_handle.unregister(*b_slot.lock().unwrap());
        }));

        let sink_b = Arc::clone(&order);
        let b_token = notifier.register(Box::new(move |_, _| sink_b.lock().unwrap().push("b")));
        *b_token_slot.lock().unwrap() = b_token;

        let sink_c = Arc::clone(&order);
        notifier.register(Box::new(move |_, _| sink_c.lock().unwrap().push("c")));

        notifier.invoke_callbacks(ConnectionState::Disconnected, ConnectionState::Connecting);
        assert_eq!(*order.lock().unwrap(), vec!["a", "c"]);
    }

    #[test]
    fn callback_unregistering_an_earlier_one_keeps_position() {
        let notifier = Arc::new(ConnectionStateNotifier::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let sink_a = Arc::clone(&order);
        let a_token = notifier.register(Box::new(move |_, _| sink_a.lock().unwrap().push("a")));

        let sink_b = Arc::clone(&order);
        let notifier_handle = Arc::clone(&notifier);
        notifier.register(Box::new(move |_, _| {
            sink_b.lock().unwrap().push("b");
            notifier_handle.unregister(a_token);
        }));

        let sink_c = Arc::clone(&order);
        notifier.register(Box::new(move |_, _| sink_c.lock().unwrap().push("c")));

        notifier.invoke_callbacks(ConnectionState::Disconnected, ConnectionState::Connecting);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }
}
