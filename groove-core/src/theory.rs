//! Pitch resolution: note names, chord symbols, roman numerals, scale
//! degrees.
//!
//! Graceful degradation throughout — an unparsable chord quality falls back
//! to a major triad rather than erroring, since pitch resolution runs on the
//! hot `on_tick` path and must never abort a step.

const LETTER_PC: [(char, i32); 7] = [
    ('C', 0),
    ('D', 2),
    ('E', 4),
    ('F', 5),
    ('G', 7),
    ('A', 9),
    ('B', 11),
];

fn letter_pc(letter: char) -> Option<i32> {
    LETTER_PC.iter().find(|(l, _)| *l == letter).map(|(_, pc)| *pc)
}

const MAJOR_SCALE: [i32; 7] = [0, 2, 4, 5, 7, 9, 11];
const MINOR_SCALE: [i32; 7] = [0, 2, 3, 5, 7, 8, 10];

fn scale_for(mode: crate::Mode) -> [i32; 7] {
    match mode {
        crate::Mode::Major => MAJOR_SCALE,
        crate::Mode::Minor => MINOR_SCALE,
    }
}

/// Parse a note name like `C3` or `G#4` into a MIDI number (C4 = 60).
pub fn note_name_to_midi(name: &str) -> Option<i64> {
    let name = name.trim();
    if name.len() < 2 {
        return None;
    }
    let mut chars = name.chars();
    let letter = chars.next()?.to_ascii_uppercase();
    let pc0 = letter_pc(letter)?;
    let rest: String = chars.collect();
    let (accidental, octave_str) = match rest.chars().next() {
        Some('#') => (1, &rest[1..]),
        Some('b') => (-1, &rest[1..]),
        _ => (0, rest.as_str()),
    };
    let octave: i64 = octave_str.parse().ok()?;
    Some(12 * (octave + 1) + pc0 as i64 + accidental)
}

/// Key letter (+ optional accidental) to pitch class 0..11.
pub fn key_to_pc(key: &str) -> Option<i32> {
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let mut chars = key.chars();
    let letter = chars.next()?.to_ascii_uppercase();
    let base = letter_pc(letter)?;
    let accidental = match chars.next() {
        Some('#') => 1,
        Some('b') => -1,
        _ => 0,
    };
    Some((base + accidental).rem_euclid(12))
}

/// A resolved chord: root base (octave 3, `base=48` = C3) plus semitone
/// intervals from the root.
pub struct Chord {
    pub base: i64,
    pub intervals: Vec<i32>,
}

fn triad_intervals(quality: &str) -> Option<[i32; 3]> {
    match quality {
        "" | "maj" => Some([0, 4, 7]),
        "m" | "min" => Some([0, 3, 7]),
        "dim" => Some([0, 3, 6]),
        "sus2" => Some([0, 2, 7]),
        "sus4" => Some([0, 5, 7]),
        _ => None,
    }
}

fn seventh_intervals(quality: &str) -> Option<[i32; 4]> {
    match quality {
        "7" => Some([0, 4, 7, 10]),
        "maj7" => Some([0, 4, 7, 11]),
        "m7" | "min7" => Some([0, 3, 7, 10]),
        _ => None,
    }
}

/// Parse an absolute chord symbol such as `Cmaj7`, `Am`, `G7`, `Dsus4`.
/// Unknown qualities degrade to a major triad.
pub fn parse_chord_symbol(sym: &str) -> Option<Chord> {
    let sym = sym.trim();
    if sym.is_empty() {
        return None;
    }
    let mut chars = sym.chars();
    let root_letter = chars.next()?.to_ascii_uppercase();
    let root_pc0 = letter_pc(root_letter)?;
    let rest: String = chars.collect();
    let (accidental, quality) = match rest.chars().next() {
        Some('#') => (1, &rest[1..]),
        Some('b') => (-1, &rest[1..]),
        _ => (0, rest.as_str()),
    };
    let quality = quality.to_ascii_lowercase();
    let intervals: Vec<i32> = if let Some(t) = triad_intervals(&quality) {
        t.to_vec()
    } else if let Some(s) = seventh_intervals(&quality) {
        s.to_vec()
    } else {
        triad_intervals("").unwrap().to_vec()
    };
    let root_pc = root_pc0 + accidental;
    let base = 48 + root_pc as i64;
    Some(Chord { base, intervals })
}

const ROMAN_DEGREES: [(&str, i32); 7] = [
    ("i", 1),
    ("ii", 2),
    ("iii", 3),
    ("iv", 4),
    ("v", 5),
    ("vi", 6),
    ("vii", 7),
];

/// Parse a roman numeral chord (`I`..`VII`, `i`..`vii`) relative to a key
/// and mode. Uppercase is a major triad, lowercase a minor triad; sevenths
/// are not supported, matching the original engine.
pub fn parse_roman_chord(sym: &str, key: &str, mode: crate::Mode) -> Option<Chord> {
    let sym = sym.trim();
    if sym.is_empty() {
        return None;
    }
    let rn: String = sym.chars().take_while(|c| "ivIV".contains(*c)).collect();
    if rn.is_empty() {
        return None;
    }
    let is_major_quality = rn.chars().all(|c| c.is_uppercase());
    let lower = rn.to_lowercase();
    let deg = ROMAN_DEGREES.iter().find(|(r, _)| *r == lower)?.1;
    let key_pc = key_to_pc(key).unwrap_or(0);
    let scale = scale_for(mode);
    let root_pc = (key_pc + scale[(deg - 1) as usize % 7]).rem_euclid(12);
    let base = 48 + root_pc as i64;
    let intervals = if is_major_quality {
        vec![0, 4, 7]
    } else {
        vec![0, 3, 7]
    };
    Some(Chord { base, intervals })
}

/// Expand a chord string (absolute symbol, falling back to roman numeral)
/// into ascending MIDI pitches, optionally clamped into a register.
pub fn expand_chord(
    sym: &str,
    key: &str,
    mode: crate::Mode,
    register: Option<(&str, &str)>,
) -> Vec<i64> {
    let chord = parse_chord_symbol(sym).or_else(|| parse_roman_chord(sym, key, mode));
    let Some(chord) = chord else {
        return Vec::new();
    };
    let (low, high) = match register {
        Some((lo, hi)) => (note_name_to_midi(lo), note_name_to_midi(hi)),
        None => (None, None),
    };
    let mut out: Vec<i64> = chord
        .intervals
        .iter()
        .map(|iv| {
            let mut p = chord.base + *iv as i64;
            if let Some(low) = low {
                while p < low {
                    p += 12;
                }
            }
            if let Some(high) = high {
                while p > high {
                    p -= 12;
                }
            }
            p
        })
        .collect();
    out.sort_unstable();
    out
}

/// Resolve a 1-indexed scale degree (clamped to 1..7) plus octave offset to
/// a MIDI pitch, relative to a key/mode.
pub fn degree_to_pitch(degree: i64, octave_offset: i64, key: &str, mode: crate::Mode) -> i64 {
    let degree = degree.clamp(1, 7);
    let key_pc = key_to_pc(key).unwrap_or(0);
    let scale = scale_for(mode);
    let pc = (key_pc + scale[(degree - 1) as usize % 7]).rem_euclid(12);
    48 + pc as i64 + 12 * octave_offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Mode;

    #[test]
    fn note_name_round_trips_c4() {
        assert_eq!(note_name_to_midi("C4"), Some(60));
        assert_eq!(note_name_to_midi("G#4"), Some(68));
    }

    #[test]
    fn unknown_chord_quality_falls_back_to_major() {
        let c = parse_chord_symbol("Cxyz").unwrap();
        assert_eq!(c.intervals, vec![0, 4, 7]);
    }

    #[test]
    fn seventh_chord_parses() {
        let c = parse_chord_symbol("Am7").unwrap();
        assert_eq!(c.intervals, vec![0, 3, 7, 10]);
    }

    #[test]
    fn roman_numeral_major_minor_quality() {
        let major = parse_roman_chord("IV", "C", Mode::Major).unwrap();
        assert_eq!(major.intervals, vec![0, 4, 7]);
        let minor = parse_roman_chord("iv", "C", Mode::Major).unwrap();
        assert_eq!(minor.intervals, vec![0, 3, 7]);
    }

    #[test]
    fn degree_to_pitch_matches_scale() {
        assert_eq!(degree_to_pitch(1, 0, "C", Mode::Major), 48);
        assert_eq!(degree_to_pitch(5, 0, "C", Mode::Major), 48 + 7);
        assert_eq!(degree_to_pitch(1, 1, "C", Mode::Major), 60);
    }

    #[test]
    fn expand_chord_honors_register() {
        let pitches = expand_chord("C", "C", Mode::Major, Some(("C4", "C6")));
        assert!(pitches.iter().all(|p| *p >= 60 && *p <= 84));
    }
}
