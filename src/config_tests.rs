use super::*;
use clap::Parser;

fn args(argv: &[&str]) -> CheckArgs {
    let mut full = vec!["reprocheck"];
    full.extend_from_slice(argv);
    CheckArgs::try_parse_from(full).expect("parse args")
}

fn file(text: &str) -> FileConfig {
    toml::from_str(text).expect("parse toml")
}

#[test]
fn file_supplies_missing_values() {
    let config = file(
        r#"
[basics]
build_command = "make"
artifact = "out/*.tar"
variations = ["time", "timezone"]
testbed = ["qemu", "/srv/vm.img"]
diff_tool = ["diff", "-r"]
verbosity = 2

[timeouts]
build_secs = 600
"#,
    );
    let settings = merge(&args(&[]), config, &Registry::builtin()).expect("merge");
    assert_eq!(settings.build_command, "make");
    assert_eq!(settings.artifact, "out/*.tar");
    assert_eq!(
        settings.selection,
        Selection::Only(vec!["time".to_string(), "timezone".to_string()])
    );
    assert_eq!(settings.testbed, vec!["qemu", "/srv/vm.img"]);
    assert_eq!(settings.diff_tool, Some(vec!["diff".to_string(), "-r".to_string()]));
    assert_eq!(settings.verbosity, 2);
    assert_eq!(settings.timeouts.build_secs, 600);
    assert_eq!(settings.timeouts.short_secs, Timeouts::default().short_secs);
}

#[test]
fn command_line_wins_over_file() {
    let config = file(
        r#"
[basics]
build_command = "make"
artifact = "a"
dont_vary = ["home"]
"#,
    );
    let cli = args(&[
        "--variations",
        "umask",
        "--diff-tool",
        "diffoscope --text -",
        "--build-timeout",
        "30",
        "src",
        "ninja",
        "b",
        "--",
        "chroot",
        "/srv/root",
    ]);
    let settings = merge(&cli, config, &Registry::builtin()).expect("merge");
    assert_eq!(settings.source_root, PathBuf::from("src"));
    assert_eq!(settings.build_command, "ninja");
    assert_eq!(settings.artifact, "b");
    assert_eq!(settings.selection, Selection::Only(vec!["umask".to_string()]));
    assert_eq!(settings.testbed, vec!["chroot", "/srv/root"]);
    assert_eq!(
        settings.diff_tool,
        Some(vec!["diffoscope".to_string(), "--text".to_string(), "-".to_string()])
    );
    assert_eq!(settings.timeouts.build_secs, 30);
}

#[test]
fn defaults_to_null_testbed_and_all_variations() {
    let settings = merge(&args(&[".", "true", "x"]), FileConfig::default(), &Registry::builtin())
        .expect("merge");
    assert_eq!(settings.testbed, vec!["null"]);
    assert_eq!(settings.selection, Selection::All);
    assert_eq!(settings.timeouts, Timeouts::default());
}

#[test]
fn missing_build_command_is_a_config_error() {
    let err = merge(&args(&[]), FileConfig::default(), &Registry::builtin()).expect_err("no command");
    assert!(matches!(err, CheckError::Config(msg) if msg.contains("build command")));
}

#[test]
fn both_selections_in_file_are_rejected() {
    let config = file(
        r#"
[basics]
build_command = "make"
artifact = "a"
variations = ["time"]
dont_vary = ["home"]
"#,
    );
    assert!(matches!(
        merge(&args(&[]), config, &Registry::builtin()),
        Err(CheckError::Config(_))
    ));
}

#[test]
fn unknown_variation_names_are_rejected() {
    let err = merge(
        &args(&["--dont-vary", "clock", ".", "true", "x"]),
        FileConfig::default(),
        &Registry::builtin(),
    )
    .expect_err("unknown name");
    assert_eq!(err.exit_code(), crate::error::EXIT_USAGE);
}

#[test]
fn unknown_keys_fail_to_load() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(DEFAULT_CONFIG_NAME);
    std::fs::write(&path, "[basics]\nbuild_comand = \"make\"\n").expect("write");
    let err = load_file(&path).expect_err("typo");
    assert!(format!("{err:#}").contains("parse config"));
    assert_eq!(find_config(None, dir.path()), Some(path));
    assert_eq!(find_config(None, &dir.path().join("missing")), None);
}

#[test]
fn empty_variation_list_selects_nothing() {
    let config = file("[basics]\nbuild_command = \"make\"\nartifact = \"a\"\n");
    let settings = merge(&args(&["--variations", ""]), config, &Registry::builtin()).expect("merge");
    assert_eq!(settings.selection, Selection::Only(Vec::new()));

    let config = file("[basics]\nbuild_command = \"make\"\nartifact = \"a\"\n");
    let settings = merge(&args(&["--dont-vary", "home,,umask"]), config, &Registry::builtin())
        .expect("merge");
    assert_eq!(
        settings.selection,
        Selection::Except(vec!["home".to_string(), "umask".to_string()])
    );
}
