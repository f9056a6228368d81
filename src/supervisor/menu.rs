//! Menu resolution: which actions the front end offers in each lifecycle phase.

use serde::{Deserialize, Serialize};

use super::state_machine::{EffectiveState, LifecycleState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuEntry {
    pub label: String,
    pub is_default: bool,
    /// Script to run or URL to open.
    pub target: String,
    /// False for informational entries the UI should render disabled.
    pub enabled: bool,
}

impl MenuEntry {
    fn action(label: &str, target: &str, is_default: bool) -> Self {
        Self {
            label: label.to_string(),
            is_default,
            target: target.to_string(),
            enabled: true,
        }
    }
}

/// Script targets the menu links to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuTargets {
    pub install: String,
    pub start: String,
}

impl Default for MenuTargets {
    fn default() -> Self {
        Self {
            install: "install.js".to_string(),
            start: "start.js".to_string(),
        }
    }
}

pub fn resolve(state: &LifecycleState, targets: &MenuTargets) -> Vec<MenuEntry> {
    resolve_effective(&state.effective(), targets)
}

/// Menu for one effective state. Exactly one entry is the default.
///
/// `Terminal` is the console view of the running app (the "Terminal/Console
/// view" entry); it targets the start script, and `GET /api/console` serves
/// its contents.
pub fn resolve_effective(state: &EffectiveState, targets: &MenuTargets) -> Vec<MenuEntry> {
    match state {
        EffectiveState::NotInstalled => vec![MenuEntry::action("Install", &targets.install, true)],
        EffectiveState::Installing => vec![MenuEntry {
            enabled: false,
            ..MenuEntry::action("Installing", &targets.install, true)
        }],
        EffectiveState::InstalledIdle => vec![
            MenuEntry::action("Launch", &targets.start, true),
            MenuEntry::action("Reinstall", &targets.install, false),
        ],
        EffectiveState::Running => vec![MenuEntry::action("Terminal", &targets.start, true)],
        EffectiveState::RunningReady(url) => vec![
            MenuEntry::action("Open", url, true),
            MenuEntry::action("Terminal", &targets.start, false),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_states() -> Vec<EffectiveState> {
        vec![
            EffectiveState::NotInstalled,
            EffectiveState::Installing,
            EffectiveState::InstalledIdle,
            EffectiveState::Running,
            EffectiveState::RunningReady("127.0.0.1:7860".into()),
        ]
    }

    fn labels(entries: &[MenuEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.label.as_str()).collect()
    }

    #[test]
    fn every_state_has_exactly_one_default() {
        let targets = MenuTargets::default();
        for state in all_states() {
            let entries = resolve_effective(&state, &targets);
            assert!(!entries.is_empty(), "{:?} produced an empty menu", state);
            assert_eq!(
                entries.iter().filter(|e| e.is_default).count(),
                1,
                "{:?} must have one default entry",
                state
            );
        }
    }

    #[test]
    fn menu_per_state() {
        let t = MenuTargets::default();
        assert_eq!(labels(&resolve_effective(&EffectiveState::NotInstalled, &t)), ["Install"]);
        assert_eq!(labels(&resolve_effective(&EffectiveState::Installing, &t)), ["Installing"]);
        assert_eq!(
            labels(&resolve_effective(&EffectiveState::InstalledIdle, &t)),
            ["Launch", "Reinstall"]
        );
        assert_eq!(labels(&resolve_effective(&EffectiveState::Running, &t)), ["Terminal"]);
    }

    #[test]
    fn ready_menu_opens_the_endpoint() {
        let state = LifecycleState {
            installed: true,
            running: true,
            endpoint: Some("127.0.0.1:7860".into()),
            ..LifecycleState::default()
        };
        let entries = resolve(&state, &MenuTargets::default());
        assert_eq!(
            entries,
            vec![
                MenuEntry {
                    label: "Open".into(),
                    is_default: true,
                    target: "127.0.0.1:7860".into(),
                    enabled: true,
                },
                MenuEntry {
                    label: "Terminal".into(),
                    is_default: false,
                    target: "start.js".into(),
                    enabled: true,
                },
            ]
        );
    }

    #[test]
    fn installing_entry_is_disabled() {
        let entries = resolve_effective(&EffectiveState::Installing, &MenuTargets::default());
        assert!(!entries[0].enabled);
        assert_eq!(entries[0].target, "install.js");
    }

    #[test]
    fn custom_targets() {
        let targets = MenuTargets {
            install: "scripts/install".into(),
            start: "scripts/start".into(),
        };
        let entries = resolve_effective(&EffectiveState::InstalledIdle, &targets);
        assert_eq!(entries[0].target, "scripts/start");
        assert_eq!(entries[1].target, "scripts/install");
    }
}
