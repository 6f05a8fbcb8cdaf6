//! Load-drill profiles (§4.J). Each profile names a target request rate and
//! duration; `m1_1k`/`m2_5k`/`m3_20k` are the three traffic-milestone
//! profiles the original rollout plan was staged against.

use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrillProfile {
    Quick,
    Standard,
    Burst,
    Soak,
    M1_1k,
    M2_5k,
    M3_20k,
}

impl DrillProfile {
    pub fn from_str(name: &str) -> Option<Self> {
        match name {
            "quick" => Some(Self::Quick),
            "standard" => Some(Self::Standard),
            "burst" => Some(Self::Burst),
            "soak" => Some(Self::Soak),
            "m1_1k" => Some(Self::M1_1k),
            "m2_5k" => Some(Self::M2_5k),
            "m3_20k" => Some(Self::M3_20k),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Standard => "standard",
            Self::Burst => "burst",
            Self::Soak => "soak",
            Self::M1_1k => "m1_1k",
            Self::M2_5k => "m2_5k",
            Self::M3_20k => "m3_20k",
        }
    }

    /// Target requests/second and total drill duration.
    pub fn target(&self) -> (u64, Duration) {
        match self {
            Self::Quick => (10, Duration::from_secs(30)),
            Self::Standard => (100, Duration::from_secs(300)),
            Self::Burst => (500, Duration::from_secs(60)),
            Self::Soak => (50, Duration::from_secs(3600)),
            Self::M1_1k => (1_000, Duration::from_secs(600)),
            Self::M2_5k => (5_000, Duration::from_secs(600)),
            Self::M3_20k => (20_000, Duration::from_secs(600)),
        }
    }

    pub fn all() -> &'static [DrillProfile] {
        &[Self::Quick, Self::Standard, Self::Burst, Self::Soak, Self::M1_1k, Self::M2_5k, Self::M3_20k]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_its_name() {
        for profile in DrillProfile::all() {
            assert_eq!(DrillProfile::from_str(profile.as_str()), Some(*profile));
        }
    }

    #[test]
    fn unknown_profile_name_is_rejected() {
        assert_eq!(DrillProfile::from_str("nonexistent"), None);
    }
}
