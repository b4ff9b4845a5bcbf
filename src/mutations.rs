//! Mutation and crossover operators over protocol traces.
//!
//! A [`Modification`] is a pure transformation from a parent [`Trace`]
//! to a child. Operators are drawn by weighted random selection (the
//! weights come from the engine configuration), or swept
//! deterministically over every modifiable field in systematic mode.
//! An operator whose applicability predicate fails on the chosen parent
//! is skipped, never retried inside the operator itself.

use serde::{Deserialize, Serialize};

use crate::{
    rands::{Rand, StdRand},
    trace::{Action, ConnectionEnd, FieldPath, FieldValue, Message, MessageType, Record, Trace},
    Error,
};

/// The result of one mutation attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationResult {
    /// The input was mutated.
    Mutated,
    /// The chosen operator was inapplicable, nothing happened.
    Skipped,
}

/// A pure transformation producing a child trace from a parent.
///
/// Closed under composition: a sequence of modifications is itself a
/// modification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Modification {
    /// Overrides one modifiable field with an explicit value.
    ReplaceField {
        /// The field to override.
        path: FieldPath,
        /// The new explicit value.
        value: FieldValue,
    },
    /// Clones one message in place, directly after the original.
    DuplicateMessage {
        /// Action index.
        action: usize,
        /// Message index within the action.
        message: usize,
    },
    /// Removes one message from a send action.
    SuppressSend {
        /// Action index (must be a send action).
        action: usize,
        /// Message index within the action.
        message: usize,
    },
    /// Appends a send action and a matching receive action.
    InsertFlight {
        /// Messages of the appended send action.
        send: Vec<Message>,
        /// Expected messages of the appended receive action.
        expect: Vec<Message>,
    },
    /// Attaches a raw record to a message in a send action.
    InsertRandomRecord {
        /// Action index (must be a send action).
        action: usize,
        /// Message index within the action.
        message: usize,
        /// The record to smuggle in.
        record: Record,
    },
    /// A composed sequence, applied left to right.
    Sequence(Vec<Modification>),
}

impl Modification {
    /// Whether this modification can be applied to `trace`.
    #[must_use]
    pub fn applicable(&self, trace: &Trace) -> bool {
        match self {
            Modification::ReplaceField { path, .. } => trace.field(*path).is_some(),
            Modification::DuplicateMessage { action, message } => trace
                .actions
                .get(*action)
                .is_some_and(|a| a.messages().len() > *message),
            Modification::SuppressSend { action, message }
            | Modification::InsertRandomRecord {
                action, message, ..
            } => trace
                .actions
                .get(*action)
                .is_some_and(|a| a.is_send() && a.messages().len() > *message),
            Modification::InsertFlight { .. } => true,
            Modification::Sequence(mods) => {
                // composed operators may cancel out (duplicate a
                // message, then suppress the original); an applicable
                // modification must change the trace
                !mods.is_empty()
                    && mods.iter().all(|m| m.applicable(trace))
                    && self.apply(trace).is_ok_and(|child| child != *trace)
            }
        }
    }

    /// Applies this modification to a clone of `trace`.
    ///
    /// Fails with [`Error::Structural`] if an addressed action, message
    /// or field does not exist. An applicable modification always
    /// changes the child in at least one observable place.
    pub fn apply(&self, trace: &Trace) -> Result<Trace, Error> {
        let mut child = trace.clone();
        self.apply_in_place(&mut child)?;
        Ok(child)
    }

    fn apply_in_place(&self, trace: &mut Trace) -> Result<(), Error> {
        match self {
            Modification::ReplaceField { path, value } => {
                let field = trace.field_mut(*path).ok_or_else(|| {
                    Error::structural(format!("no field at {path:?}"))
                })?;
                field.explicit = Some(value.clone());
            }
            Modification::DuplicateMessage { action, message } => {
                let messages = trace
                    .actions
                    .get_mut(*action)
                    .ok_or_else(|| Error::structural(format!("no action {action}")))?
                    .messages_mut();
                let original = messages
                    .get(*message)
                    .ok_or_else(|| {
                        Error::structural(format!("no message {message} in action {action}"))
                    })?
                    .clone();
                messages.insert(*message + 1, original);
            }
            Modification::SuppressSend { action, message } => {
                let act = trace
                    .actions
                    .get_mut(*action)
                    .ok_or_else(|| Error::structural(format!("no action {action}")))?;
                if !act.is_send() {
                    return Err(Error::structural(format!(
                        "action {action} is not a send action"
                    )));
                }
                let messages = act.messages_mut();
                if *message >= messages.len() {
                    return Err(Error::structural(format!(
                        "no message {message} in action {action}"
                    )));
                }
                messages.remove(*message);
            }
            Modification::InsertFlight { send, expect } => {
                trace.actions.push(Action::Send {
                    messages: send.clone(),
                });
                trace.actions.push(Action::Receive {
                    messages: expect.clone(),
                });
            }
            Modification::InsertRandomRecord {
                action,
                message,
                record,
            } => {
                let act = trace
                    .actions
                    .get_mut(*action)
                    .ok_or_else(|| Error::structural(format!("no action {action}")))?;
                if !act.is_send() {
                    return Err(Error::structural(format!(
                        "action {action} is not a send action"
                    )));
                }
                let msg = act.messages_mut().get_mut(*message).ok_or_else(|| {
                    Error::structural(format!("no message {message} in action {action}"))
                })?;
                msg.records.push(record.clone());
            }
            Modification::Sequence(mods) => {
                for m in mods {
                    m.apply_in_place(trace)?;
                }
            }
        }
        Ok(())
    }
}

/// The weightable operator tags, one per [`Modification`] variant
/// (composition excluded).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModificationKind {
    /// [`Modification::ReplaceField`]
    ReplaceField,
    /// [`Modification::DuplicateMessage`]
    DuplicateMessage,
    /// [`Modification::SuppressSend`]
    SuppressSend,
    /// [`Modification::InsertFlight`]
    InsertFlight,
    /// [`Modification::InsertRandomRecord`]
    InsertRandomRecord,
}

impl ModificationKind {
    /// All operator tags.
    pub const ALL: [ModificationKind; 5] = [
        ModificationKind::ReplaceField,
        ModificationKind::DuplicateMessage,
        ModificationKind::SuppressSend,
        ModificationKind::InsertFlight,
        ModificationKind::InsertRandomRecord,
    ];
}

/// Every field path of the trace the engine may override, in the
/// deterministic enumeration order: action index, then message index,
/// then descriptor index. Only send actions are enumerated, the engine
/// does not control the bytes of messages it merely expects.
#[must_use]
pub fn modifiable_field_paths(trace: &Trace) -> Vec<FieldPath> {
    let mut paths = Vec::new();
    for (action_idx, action) in trace.actions.iter().enumerate() {
        if !action.is_send() {
            continue;
        }
        for (message_idx, message) in action.messages().iter().enumerate() {
            for field_idx in 0..message.fields.len() {
                paths.push(FieldPath {
                    action: action_idx,
                    message: message_idx,
                    field: field_idx,
                });
            }
        }
    }
    paths
}

fn send_message_targets(trace: &Trace) -> Vec<(usize, usize)> {
    let mut targets = Vec::new();
    for (action_idx, action) in trace.actions.iter().enumerate() {
        if !action.is_send() {
            continue;
        }
        for message_idx in 0..action.messages().len() {
            targets.push((action_idx, message_idx));
        }
    }
    targets
}

const CLIENT_MESSAGE_TYPES: [MessageType; 6] = [
    MessageType::ClientHello,
    MessageType::ClientKeyExchange,
    MessageType::ChangeCipherSpec,
    MessageType::Finished,
    MessageType::Heartbeat,
    MessageType::Alert,
];

const SERVER_MESSAGE_TYPES: [MessageType; 5] = [
    MessageType::ServerHello,
    MessageType::ChangeCipherSpec,
    MessageType::Finished,
    MessageType::Heartbeat,
    MessageType::Alert,
];

/// Weighted random selection over the configured operator set, plus
/// generation of concrete random modifications for a drawn operator.
#[derive(Clone, Debug)]
pub struct ModificationScheduler {
    weights: Vec<(ModificationKind, u64)>,
    total: u64,
}

impl ModificationScheduler {
    /// Builds a scheduler from `(kind, weight)` pairs. Zero-weight
    /// entries are allowed and never drawn; a zero total is a
    /// configuration error.
    pub fn new(weights: &[(ModificationKind, u64)]) -> Result<Self, Error> {
        let total = weights.iter().map(|(_, w)| *w).sum();
        if total == 0 {
            return Err(Error::configuration(
                "operator weights must not sum to zero",
            ));
        }
        Ok(Self {
            weights: weights.to_vec(),
            total,
        })
    }

    /// Draws one operator tag according to the weights.
    pub fn schedule(&self, rand: &mut StdRand) -> ModificationKind {
        let mut ticket = rand.below(self.total);
        for (kind, weight) in &self.weights {
            if ticket < *weight {
                return *kind;
            }
            ticket -= weight;
        }
        unreachable!("ticket below total always lands in a bucket");
    }

    /// Builds a concrete random modification of the drawn kind against
    /// `trace`, or `None` if the operator is inapplicable to it.
    pub fn generate(
        &self,
        kind: ModificationKind,
        trace: &Trace,
        rand: &mut StdRand,
    ) -> Option<Modification> {
        match kind {
            ModificationKind::ReplaceField => {
                let paths = modifiable_field_paths(trace);
                if paths.is_empty() {
                    return None;
                }
                let path = *rand.choose(&paths);
                let message =
                    &trace.actions[path.action].messages()[path.message];
                let kind = message.msg_type.field_descriptors()[path.field].kind;
                Some(Modification::ReplaceField {
                    path,
                    value: FieldValue::random(kind, rand),
                })
            }
            ModificationKind::DuplicateMessage => {
                let targets = send_message_targets(trace);
                if targets.is_empty() {
                    return None;
                }
                let (action, message) = *rand.choose(&targets);
                Some(Modification::DuplicateMessage { action, message })
            }
            ModificationKind::SuppressSend => {
                let targets = send_message_targets(trace);
                if targets.is_empty() {
                    return None;
                }
                let (action, message) = *rand.choose(&targets);
                Some(Modification::SuppressSend { action, message })
            }
            ModificationKind::InsertFlight => {
                let send_type = *rand.choose(&CLIENT_MESSAGE_TYPES);
                let expect_type = *rand.choose(&SERVER_MESSAGE_TYPES);
                Some(Modification::InsertFlight {
                    send: vec![Message::new(send_type, ConnectionEnd::Client)],
                    expect: vec![Message::new(expect_type, ConnectionEnd::Server)],
                })
            }
            ModificationKind::InsertRandomRecord => {
                let targets = send_message_targets(trace);
                if targets.is_empty() {
                    return None;
                }
                let (action, message) = *rand.choose(&targets);
                let len = rand.between(1, 32) as usize;
                let record = Record {
                    content_type: rand.next() as u8,
                    payload: (0..len).map(|_| rand.next() as u8).collect(),
                };
                Some(Modification::InsertRandomRecord {
                    action,
                    message,
                    record,
                })
            }
        }
    }

    /// Draws up to `stack` operators against `trace` and composes the
    /// applicable ones. [`MutationResult::Skipped`] if every draw was
    /// inapplicable.
    pub fn generate_stacked(
        &self,
        trace: &Trace,
        stack: u64,
        rand: &mut StdRand,
    ) -> (Option<Modification>, MutationResult) {
        let draws = rand.between(1, stack.max(1));
        let mut mods = Vec::new();
        for _ in 0..draws {
            let kind = self.schedule(rand);
            if let Some(m) = self.generate(kind, trace, rand) {
                mods.push(m);
            }
        }
        match mods.len() {
            0 => (None, MutationResult::Skipped),
            1 => (Some(mods.pop().unwrap()), MutationResult::Mutated),
            _ => (Some(Modification::Sequence(mods)), MutationResult::Mutated),
        }
    }
}

/// How the next modification for a parent is chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    /// Weighted random draws, 1..=`stack` stacked per child.
    Random {
        /// Upper bound of stacked operators per child.
        stack: u64,
    },
    /// One [`Modification::ReplaceField`] per execution, sweeping every
    /// modifiable field of the base trace exactly once.
    Systematic,
}

/// Deterministic sweep state for [`Strategy::Systematic`].
///
/// Enumerates the base trace's modifiable fields in declaration order
/// and emits one field override per call. Structurally equal traces
/// always enumerate identically.
#[derive(Clone, Debug)]
pub struct SystematicSweep {
    paths: Vec<FieldPath>,
    cursor: usize,
}

impl SystematicSweep {
    /// Starts a sweep over `base`.
    #[must_use]
    pub fn new(base: &Trace) -> Self {
        Self {
            paths: modifiable_field_paths(base),
            cursor: 0,
        }
    }

    /// True once every field has been visited.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.cursor >= self.paths.len()
    }

    /// The next single-field modification, or `None` when the sweep is
    /// done. The overridden value is random; the *choice* of field is
    /// not.
    pub fn next_modification(
        &mut self,
        base: &Trace,
        rand: &mut StdRand,
    ) -> Option<Modification> {
        let path = *self.paths.get(self.cursor)?;
        self.cursor += 1;
        let message = &base.actions[path.action].messages()[path.message];
        let kind = message.msg_type.field_descriptors()[path.field].kind;
        Some(Modification::ReplaceField {
            path,
            value: FieldValue::random(kind, rand),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{
        modifiable_field_paths, Modification, ModificationKind, ModificationScheduler,
        MutationResult, SystematicSweep,
    };
    use crate::{
        rands::StdRand,
        trace::{FieldPath, FieldValue, Record, Trace},
        Error,
    };

    fn weights_all_one() -> Vec<(ModificationKind, u64)> {
        ModificationKind::ALL.iter().map(|k| (*k, 1)).collect()
    }

    #[test]
    fn test_duplicate_adds_a_message() {
        let trace = Trace::client_handshake();
        let m = Modification::DuplicateMessage {
            action: 0,
            message: 0,
        };
        assert!(m.applicable(&trace));
        let child = m.apply(&trace).unwrap();
        assert_eq!(child.message_count(), trace.message_count() + 1);
        assert_ne!(child, trace);
    }

    #[test]
    fn test_suppress_removes_a_message() {
        let trace = Trace::client_handshake();
        let m = Modification::SuppressSend {
            action: 2,
            message: 1,
        };
        let child = m.apply(&trace).unwrap();
        assert_eq!(child.send_message_count(), trace.send_message_count() - 1);
    }

    #[test]
    fn test_suppress_on_receive_action_is_structural() {
        let trace = Trace::client_handshake();
        let m = Modification::SuppressSend {
            action: 1,
            message: 0,
        };
        assert!(!m.applicable(&trace));
        assert!(matches!(m.apply(&trace), Err(Error::Structural(_))));
    }

    #[test]
    fn test_out_of_bounds_is_structural() {
        let trace = Trace::client_handshake();
        let m = Modification::ReplaceField {
            path: FieldPath {
                action: 99,
                message: 0,
                field: 0,
            },
            value: FieldValue::U8(0),
        };
        assert!(!m.applicable(&trace));
        assert!(matches!(m.apply(&trace), Err(Error::Structural(_))));
    }

    #[test]
    fn test_insert_record_attaches_payload() {
        let trace = Trace::client_handshake();
        let m = Modification::InsertRandomRecord {
            action: 0,
            message: 0,
            record: Record {
                content_type: 0x18,
                payload: vec![1, 2, 3],
            },
        };
        let child = m.apply(&trace).unwrap();
        assert_eq!(child.actions[0].messages()[0].records.len(), 1);
    }

    #[test]
    fn test_applicable_modifications_change_the_trace() {
        let trace = Trace::client_handshake();
        let mut rand = StdRand::with_seed(7);
        let scheduler = ModificationScheduler::new(&weights_all_one()).unwrap();
        for kind in ModificationKind::ALL {
            let m = scheduler.generate(kind, &trace, &mut rand).unwrap();
            assert!(m.applicable(&trace), "{kind:?} should apply to handshake");
            let child = m.apply(&trace).unwrap();
            assert_ne!(child, trace, "{kind:?} must not be a no-op");
        }
    }

    #[test]
    fn test_cancelling_sequence_is_not_applicable() {
        let trace = Trace::client_handshake();
        // duplicating a message and then suppressing the original
        // leaves the child identical to the parent
        let m = Modification::Sequence(vec![
            Modification::DuplicateMessage {
                action: 0,
                message: 0,
            },
            Modification::SuppressSend {
                action: 0,
                message: 0,
            },
        ]);
        assert_eq!(m.apply(&trace).unwrap(), trace);
        assert!(!m.applicable(&trace));
    }

    #[test]
    fn test_sequence_composes() {
        let trace = Trace::client_handshake();
        let m = Modification::Sequence(vec![
            Modification::DuplicateMessage {
                action: 0,
                message: 0,
            },
            Modification::SuppressSend {
                action: 2,
                message: 0,
            },
        ]);
        let child = m.apply(&trace).unwrap();
        assert_eq!(child.message_count(), trace.message_count());
        assert_ne!(child, trace);
    }

    #[test]
    fn test_zero_weights_are_a_configuration_error() {
        let weights = [(ModificationKind::ReplaceField, 0)];
        assert!(matches!(
            ModificationScheduler::new(&weights),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_schedule_honors_zero_weight() {
        let weights = [
            (ModificationKind::ReplaceField, 0),
            (ModificationKind::DuplicateMessage, 5),
        ];
        let scheduler = ModificationScheduler::new(&weights).unwrap();
        let mut rand = StdRand::with_seed(3);
        for _ in 0..64 {
            assert_eq!(
                scheduler.schedule(&mut rand),
                ModificationKind::DuplicateMessage
            );
        }
    }

    #[test]
    fn test_stacked_generation_on_empty_trace_is_skipped() {
        // Only record insertion configured, nowhere to insert.
        let weights = [(ModificationKind::InsertRandomRecord, 1)];
        let scheduler = ModificationScheduler::new(&weights).unwrap();
        let mut rand = StdRand::with_seed(11);
        let empty = Trace::new();
        let (m, outcome) = scheduler.generate_stacked(&empty, 3, &mut rand);
        assert!(m.is_none());
        assert_eq!(outcome, MutationResult::Skipped);
    }

    #[test]
    fn test_sweep_visits_every_send_field_once() {
        let trace = Trace::client_handshake();
        let expected = modifiable_field_paths(&trace);
        let mut rand = StdRand::with_seed(5);
        let mut sweep = SystematicSweep::new(&trace);

        let mut seen = Vec::new();
        while let Some(m) = sweep.next_modification(&trace, &mut rand) {
            match m {
                Modification::ReplaceField { path, .. } => seen.push(path),
                other => panic!("sweep emitted {other:?}"),
            }
        }
        assert!(sweep.exhausted());
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_sweep_order_is_stable_across_equal_traces() {
        let a = SystematicSweep::new(&Trace::client_handshake());
        let b = SystematicSweep::new(&Trace::client_handshake());
        assert_eq!(a.paths, b.paths);
    }
}
