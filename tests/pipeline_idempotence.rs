use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use kiosk_sync::config::Configuration;
use kiosk_sync::media::ContentDir;
use kiosk_sync::pipeline::SyncPipeline;
use tempfile::tempdir;

const FETCH_SCRIPT: &str = r#"
mkdir -p downloads/images downloads/videos downloads/texts
printf 'jpeg' > downloads/images/beach.jpg
printf 'mp4' > downloads/videos/intro.mp4
printf '[Text]\nWelcome\n' > downloads/texts/beach.txt
"#;

fn listing(content: &ContentDir) -> BTreeSet<(String, String)> {
    content
        .list_items()
        .into_iter()
        .map(|item| (item.url, item.subtitle))
        .collect()
}

fn write_script(dir: &Path, name: &str) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(name), FETCH_SCRIPT).unwrap();
}

#[tokio::test]
async fn full_sync_twice_leaves_the_same_content() {
    let tmp = tempdir().unwrap();
    let mut cfg = Configuration {
        base_dir: tmp.path().to_path_buf(),
        ..Configuration::default()
    };
    cfg.interpreter.fallback = "sh".into();
    write_script(&cfg.scripts_dir(), "get_all.py");

    let pipeline = SyncPipeline::new(&cfg);
    let content = ContentDir::new(cfg.content_dir());

    pipeline.run_full_sync().await.check().unwrap();
    let first = listing(&content);
    assert_eq!(first.len(), 2);
    assert!(first.contains(&("/downloads/images/beach.jpg".to_string(), "Welcome".to_string())));

    pipeline.run_full_sync().await.check().unwrap();
    assert_eq!(listing(&content), first);
}

#[tokio::test]
async fn missing_script_is_reported_not_raised() {
    let tmp = tempdir().unwrap();
    let mut cfg = Configuration {
        base_dir: tmp.path().to_path_buf(),
        ..Configuration::default()
    };
    cfg.interpreter.fallback = "sh".into();

    let report = SyncPipeline::new(&cfg).run_setup_sync().await;
    assert!(!report.success);
    assert!(report.check().is_err());
}
