use serde::{Deserialize, Serialize};

/// Whether the deployment context needs explicit consent before recording.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentPolicy {
    #[default]
    NotRequired,
    Required,
}

#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize)]
pub struct PrivacySettings {
    pub do_not_track: bool,
    pub cookie_consent: bool,
    pub anonymize_user_id: bool,
}

impl Default for PrivacySettings {
    fn default() -> Self {
        Self {
            do_not_track: false,
            cookie_consent: false,
            anonymize_user_id: true,
        }
    }
}

/// Partial settings change, applied with [`PrivacySettings::apply`].
#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize, Serialize)]
pub struct PrivacyUpdate {
    pub do_not_track: Option<bool>,
    pub cookie_consent: Option<bool>,
    pub anonymize_user_id: Option<bool>,
}

impl PrivacySettings {
    pub fn apply(&mut self, update: &PrivacyUpdate) {
        if let Some(dnt) = update.do_not_track {
            self.do_not_track = dnt;
        }
        if let Some(consent) = update.cookie_consent {
            self.cookie_consent = consent;
        }
        if let Some(anonymize) = update.anonymize_user_id {
            self.anonymize_user_id = anonymize;
        }
    }
}

/// The single predicate every tracking attempt goes through.
#[derive(Debug, Clone, Copy)]
pub struct PrivacyGate {
    policy: ConsentPolicy,
}

impl PrivacyGate {
    pub fn new(policy: ConsentPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ConsentPolicy {
        self.policy
    }

    /// Opt-out wins over everything; otherwise DNT denies, and consent is only
    /// needed when the policy asks for it.
    pub fn should_track(&self, settings: &PrivacySettings, opted_out: bool) -> bool {
        if opted_out || settings.do_not_track {
            return false;
        }
        settings.cookie_consent || self.policy == ConsentPolicy::NotRequired
    }
}
