//! Text/audio reconciliation.
//!
//! With voice enabled, a persona's text is held until that persona's audio
//! starts, so the words never appear before the voice. Held texts form a
//! FIFO per persona; an audio start releases the oldest one for that
//! persona regardless of which message the audio belongs to.
//!
//! Text and audio travel separately, so audio may start before its text
//! arrives. Such a start leaves a credit for the persona and the next text
//! from that persona is displayed on arrival. Each audio message counts
//! once, however often it is replayed.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use chorus_core::{ConversationMessage, MessageId, PersonaId, Session};
use tracing::debug;

/// What happened to a persona response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Appended to history immediately.
    Displayed,
    /// Waiting for the persona's audio to start.
    Held,
    /// A message with this id is already displayed or held.
    Duplicate,
}

/// Decides when persona text becomes visible.
#[derive(Debug)]
pub struct ResponseReconciler {
    session: Session,
    voice_enabled: bool,
    pending: HashMap<PersonaId, VecDeque<(u64, ConversationMessage)>>,
    /// Audio that started or failed while no text of its persona was held.
    credits: HashMap<PersonaId, VecDeque<MessageId>>,
    /// Audio messages already counted.
    heard: HashSet<MessageId>,
    typing: BTreeSet<PersonaId>,
    arrivals: u64,
}

impl ResponseReconciler {
    /// Reconciler over a session's history.
    pub fn new(session: Session, voice_enabled: bool) -> Self {
        Self {
            session,
            voice_enabled,
            pending: HashMap::new(),
            credits: HashMap::new(),
            heard: HashSet::new(),
            typing: BTreeSet::new(),
            arrivals: 0,
        }
    }

    /// Handle a persona response.
    pub fn on_response(&mut self, message: ConversationMessage) -> ReconcileOutcome {
        let Some(persona) = message.persona_id.clone() else {
            return self.display(message);
        };
        let _ = self.typing.remove(&persona);

        if self.is_known(&message.id) {
            debug!(message_id = %message.id, "duplicate response ignored");
            return ReconcileOutcome::Duplicate;
        }
        if !self.voice_enabled {
            return self.display(message);
        }
        if self.take_credit(&persona, &message.id) {
            debug!(message_id = %message.id, persona_id = %persona, "audio already began, displaying");
            return self.display(message);
        }

        debug!(message_id = %message.id, persona_id = %persona, "holding response for audio");
        self.arrivals += 1;
        self.pending
            .entry(persona)
            .or_default()
            .push_back((self.arrivals, message));
        ReconcileOutcome::Held
    }

    /// Audio for `persona` began rendering: release its oldest held text.
    pub fn on_audio_started(
        &mut self,
        persona: &PersonaId,
        message_id: &MessageId,
    ) -> Option<ConversationMessage> {
        if !self.heard.insert(message_id.clone()) {
            return None;
        }
        let Some(released) = self.release(persona, None) else {
            self.add_credit(persona, message_id);
            return None;
        };
        if &released.id != message_id {
            debug!(
                audio_message_id = %message_id,
                text_message_id = %released.id,
                "released text for a different message of the same persona"
            );
        }
        Some(released)
    }

    /// Audio `message_id` of `persona` cannot play: release its text, or
    /// the persona's oldest held text when that one is not held, so no text
    /// is stranded.
    pub fn on_audio_failed(
        &mut self,
        persona: &PersonaId,
        message_id: &MessageId,
    ) -> Option<ConversationMessage> {
        if !self.heard.insert(message_id.clone()) {
            return None;
        }
        let released = self.release(persona, Some(message_id));
        if released.is_none() {
            self.add_credit(persona, message_id);
        }
        released
    }

    /// Record a typing indicator. Returns whether the flag changed.
    pub fn on_typing(&mut self, persona: PersonaId, is_typing: bool) -> bool {
        if is_typing {
            self.typing.insert(persona)
        } else {
            self.typing.remove(&persona)
        }
    }

    /// Every persona finished its turn: clear all typing flags.
    pub fn on_all_finished(&mut self) {
        self.typing.clear();
    }

    /// Switch voice mode. Turning it off flushes every held text to history
    /// in arrival order and returns the flushed messages.
    pub fn set_voice_enabled(&mut self, enabled: bool) -> Vec<ConversationMessage> {
        self.voice_enabled = enabled;
        if enabled {
            return Vec::new();
        }
        self.credits.clear();
        self.heard.clear();
        let mut held: Vec<(u64, ConversationMessage)> =
            self.pending.drain().flat_map(|(_, queue)| queue).collect();
        held.sort_by_key(|(seq, _)| *seq);
        held.into_iter()
            .map(|(_, message)| message)
            .filter(|message| self.session.append(message.clone()))
            .collect()
    }

    /// Append the user's own message. `false` for a duplicate id.
    pub fn add_user_message(&mut self, message: ConversationMessage) -> bool {
        self.session.append(message)
    }

    /// Personas currently typing, in id order.
    pub fn typing_personas(&self) -> Vec<PersonaId> {
        self.typing.iter().cloned().collect()
    }

    /// Whether a persona is typing.
    pub fn is_typing(&self, persona: &PersonaId) -> bool {
        self.typing.contains(persona)
    }

    /// Texts held for a persona, oldest first.
    pub fn pending_for(&self, persona: &PersonaId) -> Vec<ConversationMessage> {
        self.pending
            .get(persona)
            .map(|q| q.iter().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default()
    }

    /// Total number of held texts.
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    /// Displayed history.
    pub fn history(&self) -> &[ConversationMessage] {
        self.session.history()
    }

    /// Whether voice mode is on.
    pub fn voice_enabled(&self) -> bool {
        self.voice_enabled
    }

    fn display(&mut self, message: ConversationMessage) -> ReconcileOutcome {
        if self.session.append(message) {
            ReconcileOutcome::Displayed
        } else {
            ReconcileOutcome::Duplicate
        }
    }

    fn is_known(&self, id: &MessageId) -> bool {
        self.session.contains(id)
            || self
                .pending
                .values()
                .any(|q| q.iter().any(|(_, m)| &m.id == id))
    }

    /// Move a held text of `persona` to history: the one with `preferred`
    /// id when held, the oldest otherwise.
    fn release(
        &mut self,
        persona: &PersonaId,
        preferred: Option<&MessageId>,
    ) -> Option<ConversationMessage> {
        let queue = self.pending.get_mut(persona)?;
        let index = preferred
            .and_then(|id| queue.iter().position(|(_, m)| &m.id == id))
            .unwrap_or(0);
        let (_, message) = queue.remove(index)?;
        if queue.is_empty() {
            let _ = self.pending.remove(persona);
        }
        if self.session.append(message.clone()) {
            Some(message)
        } else {
            None
        }
    }

    fn add_credit(&mut self, persona: &PersonaId, message_id: &MessageId) {
        debug!(%message_id, persona_id = %persona, "audio began before its text");
        self.credits
            .entry(persona.clone())
            .or_default()
            .push_back(message_id.clone());
    }

    /// Consume a credit of `persona`, preferring the one for `message_id`.
    fn take_credit(&mut self, persona: &PersonaId, message_id: &MessageId) -> bool {
        let Some(queue) = self.credits.get_mut(persona) else {
            return false;
        };
        let index = queue.iter().position(|id| id == message_id).unwrap_or(0);
        let taken = queue.remove(index).is_some();
        if queue.is_empty() {
            let _ = self.credits.remove(persona);
        }
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::SessionId;
    use proptest::prelude::*;

    fn reconciler(voice: bool) -> ResponseReconciler {
        ResponseReconciler::new(Session::new(SessionId::from("s"), vec!["a".into(), "b".into()]), voice)
    }

    fn response(id: &str, persona: &str) -> ConversationMessage {
        ConversationMessage::from_persona(id.into(), persona.into(), format!("text {id}"), None)
    }

    fn ids(messages: &[ConversationMessage]) -> Vec<String> {
        messages.iter().map(|m| m.id.to_string()).collect()
    }

    #[test]
    fn voice_disabled_displays_immediately() {
        let mut r = reconciler(false);
        assert!(r.on_typing("a".into(), true));
        assert_eq!(r.on_response(response("m1", "a")), ReconcileOutcome::Displayed);
        assert_eq!(ids(r.history()), ["m1"]);
        assert!(r.typing_personas().is_empty());
    }

    #[test]
    fn voice_enabled_holds_until_audio_starts() {
        let mut r = reconciler(true);
        assert_eq!(r.on_response(response("m1", "a")), ReconcileOutcome::Held);
        assert!(r.history().is_empty());
        assert_eq!(ids(&r.pending_for(&"a".into())), ["m1"]);

        // Audio for another persona releases nothing.
        assert!(r.on_audio_started(&"b".into(), &"x".into()).is_none());
        assert!(r.history().is_empty());

        let released = r.on_audio_started(&"a".into(), &"m1".into()).unwrap();
        assert_eq!(released.id, "m1".into());
        assert_eq!(ids(r.history()), ["m1"]);
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn release_is_fifo_regardless_of_message_id() {
        let mut r = reconciler(true);
        let _ = r.on_response(response("m1", "a"));
        let _ = r.on_response(response("m2", "a"));

        let first = r.on_audio_started(&"a".into(), &"m2".into()).unwrap();
        assert_eq!(first.id, "m1".into());
        let second = r.on_audio_started(&"a".into(), &"m1".into()).unwrap();
        assert_eq!(second.id, "m2".into());
        assert!(r.pending_for(&"a".into()).is_empty());
    }

    #[test]
    fn replayed_audio_releases_nothing_more() {
        let mut r = reconciler(true);
        let _ = r.on_response(response("m1", "a"));
        assert!(r.on_audio_started(&"a".into(), &"m1".into()).is_some());

        assert!(r.on_audio_started(&"a".into(), &"m1".into()).is_none());
        assert_eq!(r.on_response(response("m2", "a")), ReconcileOutcome::Held);
    }

    #[test]
    fn audio_before_text_displays_text_on_arrival() {
        let mut r = reconciler(true);
        assert!(r.on_audio_started(&"a".into(), &"m1".into()).is_none());
        assert!(r.history().is_empty());

        assert_eq!(r.on_response(response("m1", "a")), ReconcileOutcome::Displayed);
        assert_eq!(ids(r.history()), ["m1"]);

        // The credit was used up; the next text waits again.
        assert_eq!(r.on_response(response("m2", "a")), ReconcileOutcome::Held);
        assert_eq!(r.on_audio_started(&"a".into(), &"m2".into()).unwrap().id, "m2".into());
        assert_eq!(ids(r.history()), ["m1", "m2"]);
    }

    #[test]
    fn credit_belongs_to_its_persona() {
        let mut r = reconciler(true);
        assert!(r.on_audio_started(&"b".into(), &"m1".into()).is_none());
        assert_eq!(r.on_response(response("m2", "a")), ReconcileOutcome::Held);
        assert_eq!(r.on_response(response("m1", "b")), ReconcileOutcome::Displayed);
    }

    #[test]
    fn failed_audio_releases_its_own_text() {
        let mut r = reconciler(true);
        let _ = r.on_response(response("m1", "a"));
        let _ = r.on_response(response("m2", "a"));

        assert_eq!(r.on_audio_failed(&"a".into(), &"m2".into()).unwrap().id, "m2".into());
        assert_eq!(ids(r.history()), ["m2"]);
        assert_eq!(ids(&r.pending_for(&"a".into())), ["m1"]);

        assert_eq!(r.on_audio_failed(&"a".into(), &"zz".into()).unwrap().id, "m1".into());
        assert_eq!(ids(r.history()), ["m2", "m1"]);
    }

    #[test]
    fn failure_before_text_is_not_stranded() {
        let mut r = reconciler(true);
        assert!(r.on_audio_failed(&"a".into(), &"m1".into()).is_none());
        assert_eq!(r.on_response(response("m1", "a")), ReconcileOutcome::Displayed);
    }

    #[test]
    fn disabling_voice_flushes_in_arrival_order() {
        let mut r = reconciler(true);
        let _ = r.on_response(response("m1", "b"));
        let _ = r.on_response(response("m2", "a"));
        let _ = r.on_response(response("m3", "b"));

        let flushed = r.set_voice_enabled(false);
        assert_eq!(ids(&flushed), ["m1", "m2", "m3"]);
        assert_eq!(ids(r.history()), ["m1", "m2", "m3"]);
        assert_eq!(r.on_response(response("m4", "a")), ReconcileOutcome::Displayed);

        // Credits from before the switch do not carry over.
        let mut r = reconciler(true);
        assert!(r.on_audio_started(&"a".into(), &"x".into()).is_none());
        let _ = r.set_voice_enabled(false);
        let _ = r.set_voice_enabled(true);
        assert_eq!(r.on_response(response("m5", "a")), ReconcileOutcome::Held);
    }

    #[test]
    fn duplicates_are_ignored() {
        let mut r = reconciler(true);
        assert_eq!(r.on_response(response("m1", "a")), ReconcileOutcome::Held);
        assert_eq!(r.on_response(response("m1", "a")), ReconcileOutcome::Duplicate);
        assert_eq!(r.pending_for(&"a".into()).len(), 1);

        let mut r = reconciler(false);
        assert_eq!(r.on_response(response("m1", "a")), ReconcileOutcome::Displayed);
        assert_eq!(r.on_response(response("m1", "a")), ReconcileOutcome::Duplicate);
    }

    #[test]
    fn typing_flags() {
        let mut r = reconciler(true);
        assert!(r.on_typing("b".into(), true));
        assert!(r.on_typing("a".into(), true));
        assert!(!r.on_typing("a".into(), true));
        assert_eq!(r.typing_personas(), vec![PersonaId::from("a"), PersonaId::from("b")]);
        assert!(r.on_typing("a".into(), false));
        r.on_all_finished();
        assert!(r.typing_personas().is_empty());
    }

    #[test]
    fn user_messages_go_straight_to_history() {
        let mut r = reconciler(true);
        let msg = ConversationMessage::from_user("hi", None);
        assert!(r.add_user_message(msg.clone()));
        assert!(!r.add_user_message(msg));
        assert_eq!(r.history().len(), 1);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Response(u8),
        AudioStarted(u8),
        AudioFailed(u8),
        Replay(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0_u8..3).prop_map(Op::Response),
            (0_u8..3).prop_map(Op::AudioStarted),
            (0_u8..3).prop_map(Op::AudioFailed),
            (0_u8..3).prop_map(Op::Replay),
        ]
    }

    proptest! {
        #[test]
        fn text_never_precedes_audio(ops in prop::collection::vec(op(), 0..40)) {
            let mut r = reconciler(true);
            let mut texts = [0_usize; 3];
            let mut audio = [0_usize; 3];
            let mut last_audio: [Option<MessageId>; 3] = Default::default();
            let mut next_id = 0_u32;

            for op in ops {
                next_id += 1;
                match op {
                    Op::Response(p) => {
                        let msg = response(&format!("m{next_id}"), &format!("p{p}"));
                        let _ = r.on_response(msg);
                        texts[usize::from(p)] += 1;
                    }
                    Op::AudioStarted(p) | Op::AudioFailed(p) => {
                        let persona = PersonaId::from(format!("p{p}"));
                        let id = MessageId::from(format!("x{next_id}"));
                        if matches!(op, Op::AudioStarted(_)) {
                            let _ = r.on_audio_started(&persona, &id);
                        } else {
                            let _ = r.on_audio_failed(&persona, &id);
                        }
                        audio[usize::from(p)] += 1;
                        last_audio[usize::from(p)] = Some(id);
                    }
                    Op::Replay(p) => {
                        if let Some(id) = &last_audio[usize::from(p)] {
                            let persona = PersonaId::from(format!("p{p}"));
                            prop_assert!(r.on_audio_started(&persona, id).is_none());
                        }
                    }
                }
                for p in 0..3_u8 {
                    let persona = PersonaId::from(format!("p{p}"));
                    let shown = r.history().iter().filter(|m| m.is_from(&persona)).count();
                    let i = usize::from(p);
                    prop_assert_eq!(shown, texts[i].min(audio[i]));
                }
            }
        }
    }
}
