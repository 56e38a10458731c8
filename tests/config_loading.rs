// tests/config_loading.rs
use feed_ingest::config::{PipelineConfig, ENV_PATH};
use feed_ingest::export::WarmFormat;
use std::{env, fs};

#[test]
fn load_from_validates() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("pipeline.toml");
    fs::write(
        &p,
        r#"
[export]
max_keep = 0
"#,
    )
    .unwrap();
    let err = PipelineConfig::load_from(&p).unwrap_err();
    assert!(format!("{err:#}").contains("max_keep"));

    fs::write(&p, "[export]\nformat = \"csv\"\nmax_keep = 25\n").unwrap();
    let cfg = PipelineConfig::load_from(&p).unwrap();
    assert_eq!(cfg.export.format, WarmFormat::Csv);
    assert_eq!(cfg.export_settings().max_keep, 25);
}

#[test]
fn shipped_sample_config_is_valid() {
    let p = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/pipeline.toml");
    let cfg = PipelineConfig::load_from(&p).unwrap();
    let enabled: Vec<_> = cfg.enabled_sources().map(|s| s.name.as_str()).collect();
    assert_eq!(enabled, vec!["rss"]);
    assert_eq!(cfg.sources[0].feeds.len(), 2);
    // One unit per feed: the reservation must cover a whole invocation.
    assert_eq!(cfg.sources[0].units_per_fetch, cfg.sources[0].feeds.len() as u64);
}

#[serial_test::serial]
#[test]
fn default_uses_env_then_fallbacks() {
    // Isolate CWD from the repo's own config/.
    let old = env::current_dir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    env::set_current_dir(tmp.path()).unwrap();
    env::remove_var(ENV_PATH);

    // 1) Nothing on disk → built-in defaults.
    let cfg = PipelineConfig::load_default().unwrap();
    assert_eq!(cfg.export.max_keep, 500);
    assert!(cfg.sources.is_empty());

    // 2) ./config/pipeline.toml
    let cfg_dir = tmp.path().join("config");
    fs::create_dir_all(&cfg_dir).unwrap();
    fs::write(cfg_dir.join("pipeline.toml"), "[export]\nmax_keep = 42\n").unwrap();
    assert_eq!(PipelineConfig::load_default().unwrap().export.max_keep, 42);

    // 3) Env var wins.
    let p_env = tmp.path().join("other.toml");
    fs::write(&p_env, "[export]\nmax_keep = 7\n").unwrap();
    env::set_var(ENV_PATH, p_env.display().to_string());
    assert_eq!(PipelineConfig::load_default().unwrap().export.max_keep, 7);

    // 4) Env var pointing nowhere is an error, not a silent fallback.
    env::set_var(ENV_PATH, tmp.path().join("missing.toml").display().to_string());
    assert!(PipelineConfig::load_default().is_err());

    env::remove_var(ENV_PATH);
    env::set_current_dir(&old).unwrap();
}
