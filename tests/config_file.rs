use shardcore::config::Config;
use shardcore::server::ServerOptions;
use shardcore::world::entity::EntityKind;

#[tokio::test]
async fn default_file_round_trips_through_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    let path = path.to_str().expect("utf-8 path");

    Config::create_default(path).await.expect("create");
    let loaded = Config::load(path).await.expect("load");
    assert_eq!(loaded, Config::default());
}

#[tokio::test]
async fn file_settings_flow_into_world_and_server() {
    let dir = tempfile::tempdir().expect("tempdir");
    let data_dir = dir.path().join("data");
    let path = dir.path().join("shard.toml");
    let content = format!(
        r#"
[world]
width = 512
height = 256
overworld_width = 384
view_radius_default = 10
tick_ms = 50

[server]
outbound_queue = 16
autosave_minutes = 0

[storage]
data_dir = "{}"
save_file = "shard.sav"
backups = false

[[templates]]
name = "crate"
kind = "container"
display_name = "a wooden crate"
weight = 8
max_items = 50
"#,
        data_dir.display()
    );
    tokio::fs::write(&path, content).await.expect("write");

    let config = Config::load(path.to_str().expect("utf-8 path")).await.expect("load");
    let settings = config.world_settings();
    assert_eq!(settings.geometry.width, 512);
    assert_eq!(settings.geometry.overworld_width, 384);
    assert_eq!(settings.view_radius_default, 10);
    assert_eq!(settings.ticks_per_second(), 20);
    assert_eq!(config.save_path(), data_dir.join("shard.sav"));

    let crate_template = config.template_registry();
    let found = crate_template.get("crate").expect("crate template");
    assert_eq!(found.kind, EntityKind::Container);
    assert_eq!(found.max_items, Some(50));

    let options = ServerOptions::from_config(&config).expect("options");
    assert_eq!(options.outbound_queue, 16);
    assert_eq!(options.autosave, None);
    assert!(options.backups.is_none());
    assert_eq!(options.save_path, Some(data_dir.join("shard.sav")));
}

#[tokio::test]
async fn invalid_files_are_rejected_with_the_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bad.toml");
    tokio::fs::write(&path, "[world]\nwidth = 100\n").await.expect("write");
    let path = path.to_str().expect("utf-8 path");

    let err = Config::load(path).await.expect_err("invalid width");
    assert!(err.to_string().contains("bad.toml"), "{}", err);

    let missing = dir.path().join("absent.toml");
    assert!(Config::load(missing.to_str().expect("utf-8 path")).await.is_err());
}
