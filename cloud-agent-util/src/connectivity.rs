/// Tracks whether a link is up and reports transitions only.
///
/// The state starts unknown, so the first observation always counts as a
/// transition. Repeating the same observation afterwards is a no-op, which
/// keeps status reports from being sent on every poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionState(Option<bool>);

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation, returning `true` if the state changed
    pub fn update(&mut self, connected: bool) -> bool {
        let changed = self.0 != Some(connected);
        self.0 = Some(connected);
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_reports_transitions_only() {
        let mut state = ConnectionState::new();

        let reports: Vec<bool> = [false, false, false, true, true]
            .into_iter()
            .filter(|connected| state.update(*connected))
            .collect();

        assert_eq!(reports, vec![false, true]);
        assert_eq!(state, ConnectionState(Some(true)));
    }

    #[test]
    fn it_reports_the_first_observation() {
        let mut state = ConnectionState::new();
        assert!(state.update(true));
        assert!(!state.update(true));
        assert!(state.update(false));
    }
}
