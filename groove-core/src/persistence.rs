//! Document canonicalization and atomic persistence.

use std::io::Write;
use std::path::Path;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use groove_types::model::LoopDoc;

use crate::error::GrooveError;

/// Render the document into its canonical on-disk form: keys sorted
/// lexicographically (via `serde_json`'s default `BTreeMap`-backed map),
/// tracks sorted by `id`, steps by `idx`, points by time, drum-kit patterns
/// by `(bar, key)`, dense indent of two spaces, trailing newline.
pub fn canonicalize(doc: &LoopDoc) -> Result<String, GrooveError> {
    let mut doc = doc.clone();
    doc.tracks.sort_by(|a, b| a.id.cmp(&b.id));
    for track in &mut doc.tracks {
        track.pattern.steps.sort_by_key(|s| s.idx);
        for lane in &mut track.cc_lanes {
            lane.points.sort_by(|a, b| time_pos_key(&a.t).cmp(&time_pos_key(&b.t)));
        }
        if let Some(dk) = &mut track.drum_kit {
            dk.patterns.sort_by(|a, b| (a.bar, &a.key).cmp(&(b.bar, &b.key)));
        }
    }

    let value = serde_json::to_value(&doc).map_err(|e| GrooveError::Exception(e.to_string()))?;
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"  ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    serde::Serialize::serialize(&value, &mut ser).map_err(|e| GrooveError::Exception(e.to_string()))?;
    let mut rendered = String::from_utf8(buf).map_err(|e| GrooveError::Exception(e.to_string()))?;
    rendered.push('\n');
    Ok(rendered)
}

fn time_pos_key(t: &groove_types::model::TimePos) -> (i64, i64) {
    match t {
        groove_types::model::TimePos::Ticks { ticks } => (*ticks, 0),
        groove_types::model::TimePos::BarStep { bar, step } => (*bar, *step),
    }
}

pub fn content_hash(canonical_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Write the canonical document to `path` atomically: write to a temp file
/// in the same directory, then rename over the destination.
pub fn write_atomic(path: &Path, canonical_json: &str) -> Result<(), GrooveError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(canonical_json.as_bytes())?;
    tmp.persist(path).map_err(|e| GrooveError::Io(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use groove_types::model::*;

    fn doc() -> LoopDoc {
        LoopDoc {
            version: "1".into(),
            doc_version: 1,
            meta: Meta { tempo: 120.0, ppq: 96, steps_per_bar: 16, key: None, mode: None },
            device_profile: DeviceProfile::default(),
            tracks: vec![
                Track {
                    id: "b".into(),
                    name: "b".into(),
                    kind: "synth".into(),
                    midi_channel: 0,
                    pattern: Pattern { length_bars: 1, steps: Vec::new() },
                    drum_kit: None,
                    cc_lanes: Vec::new(),
                    lfos: Vec::new(),
                },
                Track {
                    id: "a".into(),
                    name: "a".into(),
                    kind: "synth".into(),
                    midi_channel: 1,
                    pattern: Pattern { length_bars: 1, steps: Vec::new() },
                    drum_kit: None,
                    cc_lanes: Vec::new(),
                    lfos: Vec::new(),
                },
            ],
        }
    }

    #[test]
    fn canonical_form_sorts_tracks_by_id() {
        let canon = canonicalize(&doc()).unwrap();
        let a_pos = canon.find("\"a\"").unwrap();
        let b_pos = canon.find("\"b\"").unwrap();
        assert!(a_pos < b_pos);
        assert!(canon.ends_with('\n'));
    }

    #[test]
    fn hash_is_stable_for_identical_input() {
        let canon = canonicalize(&doc()).unwrap();
        assert_eq!(content_hash(&canon), content_hash(&canon));
    }

    #[test]
    fn write_atomic_persists_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop.json");
        write_atomic(&path, "{}\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}\n");
    }
}
