//! Table driven finite state machine engine.
//!
//! Every protocol layer (call control, link connection, data link) is
//! described by one immutable [`Fsm`]: a dense `[event][state]` matrix of
//! handler functions. Live endpoints are [`FsmInst`]s that only hold a
//! current state and a debug flag; they are found inside the layer context
//! by a locator function, so handlers can freely dispatch further events
//! (into the same or another machine) on the same context before they
//! return.
use log::debug;

/// A state or event enumeration usable as a matrix index.
pub trait FsmEnum: Copy + PartialEq + std::fmt::Debug + 'static {
    const COUNT: usize;
    fn index(self) -> usize;
    fn name(self) -> &'static str;
}

/// Declare a state or event enum together with its diagnostic names.
macro_rules! fsm_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $label:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($(#[$vmeta])* $variant,)+
        }

        impl $name {
            #[allow(dead_code)]
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];
        }

        impl $crate::fsm::FsmEnum for $name {
            const COUNT: usize = $name::ALL.len();
            fn index(self) -> usize {
                self as usize
            }
            fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }
        }
    };
}
pub(crate) use fsm_enum;

/// Handler invoked for one (state, event) cell.
///
/// The key identifies which instance inside the context the event was
/// meant for (e.g. the D or the B link connection of a channel).
pub type Handler<C, K, E, A> = fn(&mut C, K, E, A);

/// Finds the instance for a key inside the context.
pub type Locate<C, K, S> = fn(&mut C, K) -> &mut FsmInst<S>;

/// Outcome of [`Fsm::event`].
///
/// An event without a handler is not consumed: its argument is handed back
/// so the caller can release it.
#[derive(Debug, PartialEq)]
pub enum Dispatch<A> {
    Handled,
    Unhandled(A),
}

impl<A> Dispatch<A> {
    #[must_use]
    pub fn is_handled(&self) -> bool {
        matches!(self, Dispatch::Handled)
    }
}

/// One live state machine.
#[derive(Debug)]
pub struct FsmInst<S> {
    state: S,
    pub debug: bool,
    name: String,
}

impl<S: FsmEnum> FsmInst<S> {
    pub fn new(name: impl Into<String>, state: S) -> Self {
        Self {
            state,
            debug: false,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn state(&self) -> S {
        self.state
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unconditionally move to a new state.
    ///
    /// Whether the transition is legal is decided by the handler calling
    /// this, not here.
    pub fn change_state(&mut self, state: S) {
        if self.debug {
            debug!("{}: ChangeState {}", self.name, state.name());
        }
        self.state = state;
    }
}

/// Immutable state machine definition, shared by all instances of a layer.
pub struct Fsm<C, K, S, E, A> {
    name: &'static str,
    locate: Locate<C, K, S>,
    jumpmatrix: Vec<Option<Handler<C, K, E, A>>>,
}

impl<C, K: Copy, S: FsmEnum, E: FsmEnum, A> Fsm<C, K, S, E, A> {
    /// Build the jump matrix from a flat transition table.
    ///
    /// Entries are installed in order, so a later entry for the same
    /// (state, event) overrides an earlier one.
    pub fn new(
        name: &'static str,
        locate: Locate<C, K, S>,
        table: &[(S, E, Handler<C, K, E, A>)],
    ) -> Self {
        let mut jumpmatrix = vec![None; S::COUNT * E::COUNT];
        for &(state, event, handler) in table {
            assert!(
                state.index() < S::COUNT && event.index() < E::COUNT,
                "{name}: transition {state:?}/{event:?} out of range"
            );
            jumpmatrix[event.index() * S::COUNT + state.index()] = Some(handler);
        }
        Self {
            name,
            locate,
            jumpmatrix,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Does the table have a handler for this cell?
    #[must_use]
    pub fn has_handler(&self, state: S, event: E) -> bool {
        self.jumpmatrix[event.index() * S::COUNT + state.index()].is_some()
    }

    /// Deliver an event to the instance identified by `key`.
    pub fn event(&self, ctx: &mut C, key: K, event: E, arg: A) -> Dispatch<A> {
        let fi = (self.locate)(ctx, key);
        let state = fi.state;
        match self.jumpmatrix[event.index() * S::COUNT + state.index()] {
            Some(handler) => {
                if fi.debug {
                    debug!(
                        "{}: State {} Event {}",
                        fi.name,
                        state.name(),
                        event.name()
                    );
                }
                handler(ctx, key, event, arg);
                Dispatch::Handled
            }
            None => {
                if fi.debug {
                    debug!(
                        "{}: State {} Event {} no routine",
                        fi.name,
                        state.name(),
                        event.name()
                    );
                }
                Dispatch::Unhandled(arg)
            }
        }
    }
}

/// Collects transition rows before building an [`Fsm`].
pub struct FsmBuilder<C, K, S, E, A> {
    name: &'static str,
    locate: Locate<C, K, S>,
    table: Vec<(S, E, Handler<C, K, E, A>)>,
}

impl<C, K: Copy, S: FsmEnum, E: FsmEnum, A> FsmBuilder<C, K, S, E, A> {
    pub fn new(name: &'static str, locate: Locate<C, K, S>) -> Self {
        Self {
            name,
            locate,
            table: Vec::new(),
        }
    }

    /// Add the same handler for an event in several states.
    #[must_use]
    pub fn on(mut self, states: &[S], event: E, handler: Handler<C, K, E, A>) -> Self {
        for &state in states {
            self.table.push((state, event, handler));
        }
        self
    }

    pub fn build(self) -> Fsm<C, K, S, E, A> {
        Fsm::new(self.name, self.locate, &self.table)
    }
}
