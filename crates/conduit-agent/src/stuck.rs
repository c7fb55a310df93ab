// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Detects loops the agent cannot escape on its own: repeated actions,
//! monologues, oscillation between two states, and condensation death
//! spirals. A positive detection halts the step loop and surfaces as an
//! `AgentStateChangedObservation(STUCK)`.
use conduit_events::{Action, Event, EventPayload, EventSource, Observation};

/// Inspects recent conversation history for one of five stuck patterns.
pub struct StuckDetector {
    pub headless_mode: bool,
}

impl StuckDetector {
    pub fn new(headless_mode: bool) -> Self {
        Self { headless_mode }
    }

    /// `true` if the agent appears stuck in a loop it cannot break out of.
    pub fn is_stuck(&self, history: &[Event]) -> bool {
        let scoped = self.scope_to_last_user_message(history);
        let filtered: Vec<&Event> = scoped
            .iter()
            .copied()
            .filter(|e| !matches!(e.source, EventSource::User) && !e.is_replay_noise())
            .collect();

        if filtered.len() < 3 {
            return false;
        }

        let actions: Vec<&Action> = filtered.iter().rev().filter_map(|e| e.as_action()).collect();
        let observations: Vec<&Observation> = filtered.iter().rev().filter_map(|e| e.as_observation()).collect();

        self.repeating_action_and_observation(&actions, &observations)
            || self.repeating_action_with_errors(&actions, &observations)
            || self.monologue(&filtered)
            || self.oscillation(&actions, &observations)
            || self.condensation_death_spiral(&filtered)
    }

    /// Events strictly after the last USER `MessageAction`, unless running
    /// headless (CI / non-interactive), in which case the full history is
    /// considered.
    fn scope_to_last_user_message<'a>(&self, history: &'a [Event]) -> &'a [Event] {
        if self.headless_mode {
            return history;
        }
        let last_user_msg = history
            .iter()
            .rposition(|e| matches!(e.source, EventSource::User) && matches!(e.as_action(), Some(Action::Message { .. })));
        match last_user_msg {
            Some(idx) => &history[idx + 1..],
            None => history,
        }
    }

    fn repeating_action_and_observation(&self, actions: &[&Action], observations: &[&Observation]) -> bool {
        if actions.len() < 4 || observations.len() < 4 {
            return false;
        }
        let a = &actions[..4];
        let o = &observations[..4];
        all_eq_no_pid_actions(a) && all_eq_no_pid_observations(o)
    }

    fn repeating_action_with_errors(&self, actions: &[&Action], observations: &[&Observation]) -> bool {
        if actions.len() < 3 || observations.len() < 3 {
            return false;
        }
        let a = &actions[..3];
        if !all_eq_no_pid_actions(a) {
            return false;
        }
        let o = &observations[..3];
        let all_errors = o.iter().all(|obs| matches!(obs, Observation::Error { .. }));
        let all_same_syntax_error = syntax_error_signature_matches(o);
        all_errors || all_same_syntax_error
    }

    /// Three identical AGENT `MessageAction`s in a row with no Observation
    /// interleaved between them — the model talking to itself.
    fn monologue(&self, filtered: &[&Event]) -> bool {
        let agent_messages: Vec<(usize, &str)> = filtered
            .iter()
            .enumerate()
            .filter_map(|(i, e)| match (&e.source, e.as_action()) {
                (EventSource::Agent, Some(Action::Message { text, .. })) => Some((i, text.as_str())),
                _ => None,
            })
            .collect();

        if agent_messages.len() < 3 {
            return false;
        }
        let last3 = &agent_messages[agent_messages.len() - 3..];
        if !(last3[0].1 == last3[1].1 && last3[1].1 == last3[2].1) {
            return false;
        }
        let span = &filtered[last3[0].0..=last3[2].0];
        !span.iter().any(|e| e.is_observation())
    }

    fn oscillation(&self, actions: &[&Action], observations: &[&Observation]) -> bool {
        if actions.len() < 6 || observations.len() < 6 {
            return false;
        }
        let a = &actions[..6];
        let o = &observations[..6];
        let actions_oscillate = eq_no_pid_action(a[0], a[2]) && eq_no_pid_action(a[2], a[4]) && eq_no_pid_action(a[1], a[3]) && eq_no_pid_action(a[3], a[5]);
        let obs_oscillate = eq_no_pid_observation(o[0], o[2]) && eq_no_pid_observation(o[2], o[4]) && eq_no_pid_observation(o[1], o[3]) && eq_no_pid_observation(o[3], o[5]);
        actions_oscillate && obs_oscillate
    }

    /// Last 10 events are all `AgentCondensationObservation`s with nothing
    /// else interleaved — the condenser summarizing its own summaries.
    fn condensation_death_spiral(&self, filtered: &[&Event]) -> bool {
        if filtered.len() < 10 {
            return false;
        }
        let last10 = &filtered[filtered.len() - 10..];
        let condensations = last10.iter().filter(|e| matches!(e.as_observation(), Some(Observation::AgentCondensation { .. }))).count();
        condensations >= 10 && last10.iter().all(|e| matches!(e.as_observation(), Some(Observation::AgentCondensation { .. })))
    }
}

/// Structural equality for Actions except `CmdRun`, which IPython's
/// `edit_file_by_replace` sibling compares by first-3-lines when the
/// candidate code is longer than two lines.
fn eq_no_pid_action(a: &Action, b: &Action) -> bool {
    match (a, b) {
        (Action::IPythonRunCell { code: c1 }, Action::IPythonRunCell { code: c2 }) => {
            let l1: Vec<&str> = c1.lines().collect();
            let l2: Vec<&str> = c2.lines().collect();
            if l1.len() > 2 && l2.len() > 2 {
                l1[..3.min(l1.len())] == l2[..3.min(l2.len())]
            } else {
                c1 == c2
            }
        }
        _ => format!("{a:?}") == format!("{b:?}"),
    }
}

/// Structural equality for Observations, ignoring the pid-dependent portions
/// of `CmdOutputObservation` (command + exit_code only).
fn eq_no_pid_observation(a: &Observation, b: &Observation) -> bool {
    match (a, b) {
        (
            Observation::CmdOutput { command: c1, exit_code: e1, .. },
            Observation::CmdOutput { command: c2, exit_code: e2, .. },
        ) => c1 == c2 && e1 == e2,
        _ => format!("{a:?}") == format!("{b:?}"),
    }
}

fn all_eq_no_pid_actions(items: &[&Action]) -> bool {
    items.windows(2).all(|w| eq_no_pid_action(w[0], w[1]))
}

fn all_eq_no_pid_observations(items: &[&Observation]) -> bool {
    items.windows(2).all(|w| eq_no_pid_observation(w[0], w[1]))
}

/// Recognizes three `IPythonRunCellObservation`s sharing the same Jupyter
/// SyntaxError shape: identical first line (`Cell In[1], line ...`),
/// identical error line (third from the end), and identical header/footer.
fn syntax_error_signature_matches(observations: &[&Observation]) -> bool {
    let contents: Vec<&str> = observations
        .iter()
        .filter_map(|o| match o {
            Observation::IPythonRunCell { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    if contents.len() != observations.len() {
        return false;
    }

    let mut first_lines = Vec::new();
    let mut error_lines = Vec::new();
    for content in &contents {
        let lines: Vec<&str> = content.lines().collect();
        if lines.len() < 3 {
            return false;
        }
        if !lines[0].starts_with("Cell In[1], line") {
            return false;
        }
        first_lines.push(lines[0]);
        error_lines.push(lines[lines.len() - 3]);
    }

    first_lines.windows(2).all(|w| w[0] == w[1]) && error_lines.windows(2).all(|w| w[0] == w[1]) && error_lines[0].contains("SyntaxError")
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_events::{AgentState, ConfirmationStatus};

    fn evt(id: u64, source: EventSource, payload: EventPayload) -> Event {
        Event { id, timestamp: chrono::Utc::now(), source, cause: None, message: None, payload }
    }

    fn cmd_action(cmd: &str) -> Action {
        Action::CmdRun { command: cmd.into(), timeout_secs: None, is_static: false, confirmation_status: Some(ConfirmationStatus::Confirmed) }
    }

    fn cmd_obs(cmd: &str, code: i32) -> Observation {
        Observation::CmdOutput { command: cmd.into(), exit_code: code, content: "x".into() }
    }

    #[test]
    fn fewer_than_three_events_is_never_stuck() {
        let history = vec![
            evt(0, EventSource::Agent, EventPayload::Action(cmd_action("ls"))),
            evt(1, EventSource::Environment, EventPayload::Observation(cmd_obs("ls", 0))),
        ];
        assert!(!StuckDetector::new(false).is_stuck(&history));
    }

    #[test]
    fn four_identical_action_observation_pairs_is_stuck() {
        let mut history = Vec::new();
        let mut id = 0;
        for _ in 0..4 {
            history.push(evt(id, EventSource::Agent, EventPayload::Action(cmd_action("flaky"))));
            id += 1;
            history.push(evt(id, EventSource::Environment, EventPayload::Observation(cmd_obs("flaky", 1))));
            id += 1;
        }
        assert!(StuckDetector::new(false).is_stuck(&history));
    }

    #[test]
    fn three_repeating_errors_is_stuck() {
        let mut history = Vec::new();
        let mut id = 0;
        for _ in 0..3 {
            history.push(evt(id, EventSource::Agent, EventPayload::Action(cmd_action("bad"))));
            id += 1;
            history.push(evt(id, EventSource::Environment, EventPayload::Observation(Observation::Error { content: "boom".into() })));
            id += 1;
        }
        assert!(StuckDetector::new(false).is_stuck(&history));
    }

    #[test]
    fn monologue_with_no_observation_between_is_stuck() {
        let history = vec![
            evt(0, EventSource::Agent, EventPayload::Action(Action::Message { text: "I am thinking".into(), images: vec![] })),
            evt(1, EventSource::Agent, EventPayload::Action(Action::Message { text: "I am thinking".into(), images: vec![] })),
            evt(2, EventSource::Agent, EventPayload::Action(Action::Message { text: "I am thinking".into(), images: vec![] })),
        ];
        assert!(StuckDetector::new(false).is_stuck(&history));
    }

    #[test]
    fn monologue_interrupted_by_observation_is_not_stuck() {
        let history = vec![
            evt(0, EventSource::Agent, EventPayload::Action(Action::Message { text: "hi".into(), images: vec![] })),
            evt(1, EventSource::Environment, EventPayload::Observation(Observation::Success)),
            evt(2, EventSource::Agent, EventPayload::Action(Action::Message { text: "hi".into(), images: vec![] })),
        ];
        assert!(!StuckDetector::new(false).is_stuck(&history));
    }

    #[test]
    fn oscillation_between_two_actions_is_stuck() {
        let mut history = Vec::new();
        let mut id = 0;
        for i in 0..6 {
            let cmd = if i % 2 == 0 { "a" } else { "b" };
            history.push(evt(id, EventSource::Agent, EventPayload::Action(cmd_action(cmd))));
            id += 1;
            history.push(evt(id, EventSource::Environment, EventPayload::Observation(cmd_obs(cmd, 0))));
            id += 1;
        }
        assert!(StuckDetector::new(false).is_stuck(&history));
    }

    #[test]
    fn condensation_death_spiral_is_stuck() {
        let mut history = Vec::new();
        for id in 0..10u64 {
            history.push(evt(id, EventSource::Environment, EventPayload::Observation(Observation::AgentCondensation { summary: format!("s{id}") })));
        }
        assert!(StuckDetector::new(false).is_stuck(&history));
    }

    #[test]
    fn distinct_commands_are_not_stuck() {
        let history = vec![
            evt(0, EventSource::Agent, EventPayload::Action(cmd_action("ls"))),
            evt(1, EventSource::Environment, EventPayload::Observation(cmd_obs("ls", 0))),
            evt(2, EventSource::Agent, EventPayload::Action(cmd_action("pwd"))),
            evt(3, EventSource::Environment, EventPayload::Observation(cmd_obs("pwd", 0))),
        ];
        assert!(!StuckDetector::new(false).is_stuck(&history));
    }

    #[test]
    fn headless_mode_considers_full_history_even_after_user_message() {
        let mut history = vec![evt(0, EventSource::User, EventPayload::Action(Action::Message { text: "go".into(), images: vec![] }))];
        let mut id = 1;
        for _ in 0..4 {
            history.push(evt(id, EventSource::Agent, EventPayload::Action(cmd_action("x"))));
            id += 1;
            history.push(evt(id, EventSource::Environment, EventPayload::Observation(cmd_obs("x", 1))));
            id += 1;
        }
        assert!(StuckDetector::new(true).is_stuck(&history));
        assert!(StuckDetector::new(false).is_stuck(&history));
    }

    #[test]
    fn agent_state_changed_observation_is_not_replay_noise_for_stuck_scan() {
        let history = vec![evt(
            0,
            EventSource::Environment,
            EventPayload::Observation(Observation::AgentStateChanged { state: AgentState::Running, reason: None }),
        )];
        assert!(!StuckDetector::new(false).is_stuck(&history));
    }
}
