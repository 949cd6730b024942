use super::*;

#[test]
fn config_dir_is_named_for_the_application() {
    let dir = get_config_dir().expect("should resolve a config dir");
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .expect("should have a final component");
    assert!(name == ".corpus-index" || name == "corpus-index");
}

#[test]
fn rendered_config_hides_secrets() {
    let mut config = Config::default();
    config.vector_store.qdrant.api_key = Some("super-secret".to_string());

    let lines = render_config(&config);
    assert!(lines.iter().any(|l| l.contains("api_key=<set>")));
    assert!(lines.iter().all(|l| !l.contains("super-secret")));
    assert!(lines.iter().any(|l| l == "Default vector engine: lancedb"));
}
