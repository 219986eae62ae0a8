use chrono::{TimeZone, Utc};
use geo::polygon;
use ndarray::{array, Array2};
use rastack::core::{BitmaskProcessor, Reducer};
use rastack::io::{LoadScope, TileSource, TileStore};
use rastack::types::is_no_data;
use rastack::{CompositeError, GeoTransform, Tile, TileCollection};
use tempfile::TempDir;

fn scene(day: u32, red: f32, qa: Array2<f32>) -> Tile {
    let shape = qa.dim();
    Tile::new(
        GeoTransform::north_up(300000.0, 4300020.0, 10.0),
        vec![("B4", Array2::from_elem(shape, red)), ("QA60", qa)],
    )
    .unwrap()
    .with_timestamp(Utc.with_ymd_and_hms(2021, 7, day, 16, 0, 0).unwrap())
    .with_index(&format!("202107{:02}_T18STJ", day))
}

#[test]
fn test_store_load_and_composite() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let store = TileStore::open(dir.path()).unwrap();
    let dataset = store.dataset("COPERNICUS/S2_SR").unwrap();

    let collection = TileCollection::new(vec![
        scene(3, 1000.0, array![[0.0, 1024.0], [0.0, 0.0]]),
        scene(13, 3000.0, array![[0.0, 0.0], [2048.0, 0.0]]),
        scene(23, 2000.0, array![[0.0, 0.0], [0.0, 0.0]]),
    ]);
    let ids = dataset.save_collection(&collection).unwrap();
    assert_eq!(ids.len(), 3);
    assert!(dir.path().join("COPERNICUS").join("S2_SR").is_dir());

    let scope = LoadScope::all()
        .with_dates(
            Utc.with_ymd_and_hms(2021, 7, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2021, 7, 20, 0, 0, 0).unwrap(),
        )
        .with_region(polygon![
            (x: 300005.0, y: 4300005.0),
            (x: 300015.0, y: 4300005.0),
            (x: 300015.0, y: 4300015.0),
        ]);
    let loaded = store.load_collection("COPERNICUS/S2_SR", &scope).unwrap();
    assert_eq!(loaded.len(), 2);

    let masked = loaded.map(&BitmaskProcessor::sentinel2()).into_result().unwrap();
    let composite = masked.reduce(Reducer::Mean).unwrap();
    let red = composite.band("B4").unwrap();

    assert!((red[[0, 0]] - 0.2).abs() < 1e-6);
    assert!((red[[0, 1]] - 0.3).abs() < 1e-6);
    assert!((red[[1, 0]] - 0.1).abs() < 1e-6);
    assert!(!is_no_data(red[[1, 1]]));
}

#[test]
fn test_missing_dataset() {
    let dir = TempDir::new().unwrap();
    let store = TileStore::open(dir.path()).unwrap();
    let result = store.load_collection("LANDSAT/LC08", &LoadScope::all());
    assert!(matches!(result, Err(CompositeError::DatasetNotFound(_))));
}
