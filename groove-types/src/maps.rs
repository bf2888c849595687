//! Closed enumeration tables: CC name aliases and the default drum map.
//!
//! Ported from the values hard-coded in the original engine's `NAME_CC` and
//! `DEFAULT_DRUM_MAP` dictionaries. Kept as flat `const` arrays with linear
//! lookup rather than a lazily-built map — the tables are small and this
//! keeps them usable in a `const` context.

/// `name:<id>` -> CC number, for [`crate::model::CcDest::Symbolic`] resolution.
const CC_NAMES: &[(&str, u8)] = &[
    ("track_volume", 7),
    ("track_mute", 9),
    ("track_pan", 10),
    ("param1", 12),
    ("param2", 13),
    ("param3", 14),
    ("param4", 15),
    ("amp_attack", 20),
    ("amp_decay", 21),
    ("amp_sustain", 22),
    ("amp_release", 23),
    ("filter_attack", 24),
    ("filter_decay", 25),
    ("filter_sustain", 26),
    ("filter_release", 27),
    ("voice_mode", 28),
    ("portamento", 29),
    ("pitchbend_amount", 30),
    ("engine_volume", 31),
    ("cutoff", 32),
    ("resonance", 33),
    ("env_amount", 34),
    ("key_tracking", 35),
    ("send_ext", 36),
    ("send_tape", 37),
    ("send_fx1", 38),
    ("send_fx2", 39),
    ("lfo_dest", 40),
    ("lfo_param", 41),
];

/// Resolve a symbolic CC name to its control number.
pub fn cc_by_name(name: &str) -> Option<u8> {
    CC_NAMES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, cc)| *cc)
}

/// Default General-MIDI-ish drum key -> pitch map, used when a track has no
/// `deviceProfile.drumMap` override.
const DEFAULT_DRUM_MAP: &[(&str, u8)] = &[
    ("kick", 53),
    ("kick_alt", 54),
    ("snare", 55),
    ("snare_alt", 56),
    ("rim", 57),
    ("clap", 58),
    ("tambourine", 59),
    ("shaker", 60),
    ("closed_hat", 61),
    ("open_hat", 62),
    ("pedal_hat", 63),
    ("low_tom", 65),
    ("crash", 66),
    ("mid_tom", 67),
    ("ride", 68),
    ("high_tom", 69),
    ("conga_low", 71),
    ("conga_high", 72),
    ("cowbell", 73),
    ("guiro", 74),
    ("metal", 75),
    ("chi", 76),
];

/// Aliases that fold onto a canonical drum key before the table lookup.
const DRUM_ALIASES: &[(&str, &str)] = &[
    ("ch", "closed_hat"),
    ("hh", "closed_hat"),
    ("oh", "open_hat"),
    ("lt", "low_tom"),
    ("mt", "mid_tom"),
    ("ht", "high_tom"),
];

/// Resolve a drum key to a MIDI pitch, checking the caller-supplied override
/// table first, then aliases, then the built-in default map.
pub fn drum_pitch(key: &str, overrides: &std::collections::HashMap<String, u8>) -> Option<u8> {
    if let Some(p) = overrides.get(key) {
        return Some(*p);
    }
    let canonical = DRUM_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, canon)| *canon)
        .unwrap_or(key);
    if let Some(p) = overrides.get(canonical) {
        return Some(*p);
    }
    DEFAULT_DRUM_MAP
        .iter()
        .find(|(k, _)| *k == canonical)
        .map(|(_, p)| *p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_map_has_kick_and_snare() {
        let overrides = HashMap::new();
        assert_eq!(drum_pitch("kick", &overrides), Some(53));
        assert_eq!(drum_pitch("snare", &overrides), Some(55));
    }

    #[test]
    fn aliases_fold_to_canonical() {
        let overrides = HashMap::new();
        assert_eq!(drum_pitch("hh", &overrides), drum_pitch("closed_hat", &overrides));
        assert_eq!(drum_pitch("oh", &overrides), Some(62));
    }

    #[test]
    fn override_takes_precedence() {
        let mut overrides = HashMap::new();
        overrides.insert("kick".to_string(), 36);
        assert_eq!(drum_pitch("kick", &overrides), Some(36));
    }

    #[test]
    fn unknown_key_is_none() {
        let overrides = HashMap::new();
        assert_eq!(drum_pitch("nonexistent", &overrides), None);
    }

    #[test]
    fn cc_name_lookup() {
        assert_eq!(cc_by_name("cutoff"), Some(32));
        assert_eq!(cc_by_name("missing"), None);
    }
}
