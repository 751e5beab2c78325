use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use detection_bench::{RunConfig, RunError, SampleOrder};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "DETECT_CONFIG",
        "DETECT_DATA_DIR",
        "DETECT_DB_PATH",
        "DETECT_BACKEND",
        "DETECT_THRESHOLD",
        "DETECT_MAX_IMAGES",
        "DETECT_CLASSIFICATIONS",
        "DETECT_RANDOMIZE",
        "DETECT_SEED",
        "DETECT_RUN_NAME",
        "DETECT_JOB_ID",
        "DETECT_OLLAMA_HOST",
        "DETECT_OLLAMA_MODEL",
        "DETECT_FACE_ENDPOINT",
        "DETECT_MODEL_PATH",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "data_dir": "/srv/corpus",
        "db_path": "bench.db",
        "threshold": 0.6,
        "classifications": ["crowd", "empty"],
        "randomize": true,
        "image_timeout_secs": 2.5,
        "backend": {
            "name": "llm",
            "ollama_model": "llava:7b",
            "request_timeout_secs": 30
        },
        "monitor": {
            "interval_ms": 250,
            "gpu": false
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("DETECT_CONFIG", file.path());
    std::env::set_var("DETECT_THRESHOLD", "0.7");
    std::env::set_var("DETECT_CLASSIFICATIONS", "crowd, single ,");
    std::env::set_var("DETECT_SEED", "99");
    std::env::set_var("DETECT_OLLAMA_HOST", "http://gpu-box:11434");

    let cfg = RunConfig::load().expect("load config");

    assert_eq!(cfg.data_dir.to_str(), Some("/srv/corpus"));
    assert_eq!(cfg.db_path, "bench.db");
    assert_eq!(cfg.threshold, 0.7);
    assert_eq!(
        cfg.classifications,
        Some(vec!["crowd".to_string(), "single".to_string()])
    );
    assert_eq!(cfg.image_timeout, Some(Duration::from_millis(2500)));
    assert_eq!(cfg.backend.name, "llm");
    assert_eq!(cfg.backend.ollama_model, "llava:7b");
    assert_eq!(cfg.backend.ollama_host, "http://gpu-box:11434");
    assert_eq!(cfg.backend.request_timeout, Duration::from_secs(30));
    assert_eq!(cfg.monitor.interval, Duration::from_millis(250));
    assert!(!cfg.monitor.gpu);
    assert_eq!(cfg.sampling().order, SampleOrder::Randomized { seed: Some(99) });

    clear_env();
}

#[test]
fn defaults_apply_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = RunConfig::load().expect("load defaults");
    assert_eq!(cfg.backend.name, "stub");
    assert_eq!(cfg.threshold, 0.5);
    assert!(cfg.randomize);
    assert_eq!(cfg.max_images, None);
    assert_eq!(cfg.backend.ollama_host, "http://localhost:11434");

    clear_env();
}

#[test]
fn env_can_disable_shuffling() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("DETECT_RANDOMIZE", "false");
    std::env::set_var("DETECT_MAX_IMAGES", "25");
    let cfg = RunConfig::load().expect("load config");
    assert_eq!(cfg.sampling().order, SampleOrder::Lexical);
    assert_eq!(cfg.sampling().max_images, Some(25));

    clear_env();
}

#[test]
fn rejects_out_of_range_threshold() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("DETECT_THRESHOLD", "1.2");
    let err = RunConfig::load().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RunError>(),
        Some(RunError::Input(_))
    ));

    clear_env();
}

#[test]
fn rejects_unparseable_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("DETECT_MAX_IMAGES", "lots");
    assert!(RunConfig::load().is_err());
    std::env::remove_var("DETECT_MAX_IMAGES");

    std::env::set_var("DETECT_RANDOMIZE", "sometimes");
    assert!(RunConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_malformed_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"{ not json").expect("write config");
    std::env::set_var("DETECT_CONFIG", file.path());
    assert!(RunConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_negative_image_timeout_in_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, br#"{"image_timeout_secs": -1.0}"#)
        .expect("write config");
    std::env::set_var("DETECT_CONFIG", file.path());
    let err = RunConfig::load().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<RunError>(),
        Some(RunError::Input(_))
    ));

    clear_env();
}

#[test]
fn face_fallback_defaults_to_opencv_and_can_be_disabled() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = RunConfig::load().unwrap();
    assert_eq!(cfg.backend.face_fallback_detector.as_deref(), Some("opencv"));

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(
        &mut file,
        br#"{"backend": {"face_detector": "retinaface", "face_fallback_detector": ""}}"#,
    )
    .expect("write config");
    std::env::set_var("DETECT_CONFIG", file.path());
    let cfg = RunConfig::load().unwrap();
    assert_eq!(cfg.backend.face_detector, "retinaface");
    assert_eq!(cfg.backend.face_fallback_detector, None);

    clear_env();
}
