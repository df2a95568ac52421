use std::path::Path;
use std::process::{Command, Output};

use memcard::{AuthKeys, Config};
use tempfile::tempdir;

fn memcard(image: &Path, config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_memcard"))
        .arg("--image")
        .arg(image)
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .expect("run memcard")
}

fn write_config(path: &Path, with_keys: bool) {
    let mut config = Config::default();
    if with_keys {
        config.auth.set_keys(&AuthKeys {
            key_left: *b"0123456789abcdef",
            iv_left: *b"ivleft00",
            key_right: *b"fedcba9876543210",
            iv_right: *b"ivright0",
            challenge_iv: *b"chall-iv",
        });
    }
    std::fs::write(path, config.to_toml_string().expect("serialize")).expect("write config");
}

#[test]
fn format_inject_list_extract() {
    let dir = tempdir().expect("temp dir");
    let image = dir.path().join("card.ps2");
    let config = dir.path().join("memcard.toml");
    let source = dir.path().join("save.bin");
    let copy = dir.path().join("copy.bin");
    write_config(&config, true);
    std::fs::write(&source, b"game progress").expect("write source");

    assert!(memcard(&image, &config, &["format"]).status.success());
    assert!(memcard(&image, &config, &["mkdir", "/BASLUS-20000"]).status.success());
    let inject = memcard(
        &image,
        &config,
        &["inject", source.to_str().expect("utf-8 path"), "/BASLUS-20000/SAVE"],
    );
    assert!(inject.status.success(), "{}", String::from_utf8_lossy(&inject.stderr));

    let list = memcard(&image, &config, &["list", "/BASLUS-20000"]);
    assert!(list.status.success());
    assert!(String::from_utf8_lossy(&list.stdout).contains("SAVE"));

    let extract = memcard(
        &image,
        &config,
        &["extract", "/BASLUS-20000/SAVE", copy.to_str().expect("utf-8 path")],
    );
    assert!(extract.status.success());
    assert_eq!(std::fs::read(&copy).expect("read copy"), b"game progress");
}

#[test]
fn errors_map_to_exit_codes() {
    let dir = tempdir().expect("temp dir");
    let image = dir.path().join("card.ps2");
    let config = dir.path().join("memcard.toml");
    write_config(&config, false);

    assert!(memcard(&image, &config, &["format"]).status.success());
    assert_eq!(memcard(&image, &config, &["format"]).status.code(), Some(104));
    assert_eq!(
        memcard(&image, &config, &["list", "/MISSING"]).status.code(),
        Some(4)
    );
    assert_eq!(
        memcard(&image, &config, &["mkdir", "/SAVE"]).status.code(),
        Some(110)
    );
}

#[test]
fn unformatted_images_are_rejected() {
    let dir = tempdir().expect("temp dir");
    let image = dir.path().join("blank.ps2");
    let config = dir.path().join("memcard.toml");
    write_config(&config, false);
    std::fs::write(&image, vec![0xFFu8; 16 * 528]).expect("write blank");

    assert_eq!(memcard(&image, &config, &["info"]).status.code(), Some(2));
}
