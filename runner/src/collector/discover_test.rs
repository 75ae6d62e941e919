use super::{discover, manifest_simulations, CollectError, Collector};
use std::{fs, fs::File, io::Write, path::Path};
use zip::{write::FileOptions, ZipWriter};

fn write_archive(path: &Path, entries: &[(&str, &str)]) {
    let mut zip = ZipWriter::new(File::create(path).unwrap());

    for (name, content) in entries {
        zip.start_file(*name, FileOptions::default()).unwrap();
        zip.write_all(content.as_bytes()).unwrap();
    }

    zip.finish().unwrap();
}

#[test]
pub fn archive_yields_one_unit_with_manifest_simulations() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("Input.ZIP");
    write_archive(
        &archive,
        &[
            ("Wheat.APSIM", "<folder/>"),
            (
                "run.simulations",
                "/Simulations/Wheat/Sow Early \n/Simulations/Wheat/Sow Late\n\n",
            ),
        ],
    );

    let units = discover(&archive).unwrap();

    assert_eq!(units.len(), 1);
    assert_eq!(units[0].model, "Wheat.APSIM");
    assert_eq!(units[0].simulations, vec!["Sow Early", "Sow Late"]);
}

#[test]
pub fn archive_without_simulations_fails() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("input.zip");
    write_archive(&archive, &[("model.apsimx", "{}"), ("run.simulations", "\n")]);

    assert!(matches!(
        discover(&archive),
        Err(CollectError::NoSimulationsFound(_))
    ));
}

#[test]
pub fn directory_yields_one_unit_per_model_file() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["b.apsim", "a.apsim", "notes.txt", "c.apsimx"] {
        fs::write(dir.path().join(name), "x").unwrap();
    }

    let units = discover(dir.path()).unwrap();

    // primary format wins, secondary files are ignored
    let models = units.iter().map(|unit| unit.model.as_str()).collect::<Vec<_>>();
    assert_eq!(models, vec!["a.apsim", "b.apsim"]);
    assert!(units
        .iter()
        .all(|unit| unit.simulations == vec![unit.model.clone()]));
}

#[test]
pub fn directory_falls_back_to_secondary_format() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("one.apsimx"), "x").unwrap();
    fs::write(dir.path().join("two.ApsimX"), "x").unwrap();

    assert_eq!(discover(dir.path()).unwrap().len(), 2);
}

#[test]
pub fn directory_without_models_fails() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("readme.md"), "x").unwrap();

    assert!(matches!(
        discover(dir.path()),
        Err(CollectError::NoModelFilesFound(_))
    ));
}

#[test]
pub fn missing_or_unrecognized_input_fails() {
    let dir = tempfile::tempdir().unwrap();
    let text = dir.path().join("input.txt");
    fs::write(&text, "x").unwrap();

    assert!(matches!(
        Collector::load(&dir.path().join("absent")),
        Err(CollectError::InputNotFound(_))
    ));
    assert!(matches!(
        Collector::load(&text),
        Err(CollectError::InputNotFound(_))
    ));
}

#[test]
pub fn manifest_takes_trailing_token_per_line() {
    assert_eq!(
        manifest_simulations("/a/b/ first \nsecond\n/c/third/\n"),
        vec!["first", "second", "third"]
    );
}

#[test]
pub fn manifest_paths_are_split_on_forward_slashes_only() {
    assert_eq!(
        manifest_simulations("/Simulations/Wheat\\Early\n"),
        vec!["Wheat\\Early"]
    );
}
