use anyhow::Result;
use std::io::Cursor;

use facematch::query;
use facematch::session::label_faces;
use facematch::{match_face, Detection, FaceSample, FaceStore, MatchError};

fn face(descriptor: Vec<f32>) -> FaceSample {
    FaceSample {
        detection: Detection {
            bbox: [0.0, 0.0, 10.0, 10.0],
            score: 0.9,
            landmarks: [0.0; 10],
        },
        descriptor,
    }
}

#[test]
fn register_then_recognize_then_forget() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = FaceStore::open(dir.path());

    let ada = store.register("Ada", vec![0.1, 0.2, 0.3], vec![])?;
    let bob = store.register("Bob", vec![0.9, 0.1, 0.0], vec![])?;

    let frame = vec![face(vec![0.1, 0.25, 0.3]), face(vec![0.85, 0.1, 0.05])];
    let labels: Vec<_> = label_faces(frame.clone(), &store.list()?, 0.6)?
        .into_iter()
        .map(|r| r.result.id)
        .collect();
    assert_eq!(labels, vec![Some(ada.id.clone()), Some(bob.id.clone())]);

    assert!(store.delete(&bob.id)?);
    let after = label_faces(frame, &store.list()?, 0.3)?;
    assert_eq!(after[0].result.id, Some(ada.id));
    assert!(!after[1].result.matched);
    assert_eq!(after[1].label(), "Unknown");
    Ok(())
}

#[test]
fn records_survive_reopening_the_store() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let id = FaceStore::open(dir.path())
        .register("Ada", vec![0.0, 1.0], b"png".to_vec())?
        .id;

    let reopened = FaceStore::open(dir.path()).list()?;
    assert_eq!(reopened.len(), 1);
    assert_eq!(reopened[0].id, id);
    assert_eq!(reopened[0].thumbnail, b"png");

    let r = match_face(&[0.0, 1.0], &reopened, 0.6)?;
    assert_eq!(r.confidence, 100);
    Ok(())
}

#[test]
fn query_of_wrong_length_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = FaceStore::open(dir.path());
    store.register("Ada", vec![0.0, 0.0], vec![])?;

    let err = match_face(&[0.0, 0.0, 0.0], &store.list()?, 0.6).unwrap_err();
    assert_eq!(
        err,
        MatchError::DimensionMismatch {
            expected: 3,
            found: 2,
            index: 0
        }
    );
    Ok(())
}

#[test]
fn json_query_matches_stored_face() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = FaceStore::open(dir.path().join("faces"));
    let ada = store.register("Ada", vec![0.0, 0.0], vec![])?;
    store.register("Bob", vec![3.0, 4.0], vec![])?;

    let path = dir.path().join("query.json");
    std::fs::write(&path, "[0.0, 0.0]")?;
    let descriptor = query::read_descriptor(&path, std::io::empty())?;
    assert_eq!(descriptor, vec![0.0, 0.0]);

    let result = query::match_stored(&store, &descriptor, 0.6)?;
    assert_eq!(result.id, Some(ada.id.clone()));
    assert_eq!(result.confidence, 100);

    let json: serde_json::Value = serde_json::from_str(&query::render(&result)?)?;
    assert_eq!(json["matched"], true);
    assert_eq!(json["id"], ada.id.as_str());
    assert_eq!(json["name"], "Ada");
    assert_eq!(json["confidence"], 100);
    Ok(())
}

#[test]
fn dash_reads_query_from_stdin() -> Result<()> {
    let stdin = Cursor::new(b" [1.5, -2, 0.25]\n".to_vec());
    let descriptor = query::read_descriptor(std::path::Path::new("-"), stdin)?;
    assert_eq!(descriptor, vec![1.5, -2.0, 0.25]);
    Ok(())
}

#[test]
fn malformed_query_is_rejected() {
    for raw in ["", "{\"a\": 1}", "[1, \"x\"]", "[1, 2"] {
        let err = query::parse_descriptor(raw).unwrap_err();
        assert!(err.to_string().contains("JSON array of numbers"), "{raw}");
    }

    let dir = tempfile::tempdir().unwrap();
    assert!(query::read_descriptor(&dir.path().join("absent.json"), std::io::empty()).is_err());
}

#[test]
fn empty_store_renders_null_distance() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = FaceStore::open(dir.path());

    let result = query::match_stored(&store, &[0.1, 0.2], 0.6)?;
    assert!(!result.matched);
    assert!(result.distance.is_infinite());

    let json: serde_json::Value = serde_json::from_str(&query::render(&result)?)?;
    assert!(json["distance"].is_null());
    assert!(json["id"].is_null());
    assert_eq!(json["name"], "Unknown");
    assert_eq!(json["confidence"], 0);
    Ok(())
}

#[test]
fn empty_query_reports_invalid_input() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = FaceStore::open(dir.path());
    store.register("Ada", vec![0.0, 0.0], vec![])?;

    let descriptor = query::parse_descriptor("[]")?;
    let err = query::match_stored(&store, &descriptor, 0.6).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<MatchError>(),
        Some(MatchError::InvalidInput(_))
    ));
    Ok(())
}
