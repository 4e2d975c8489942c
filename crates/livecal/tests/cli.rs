#![cfg(feature = "cli")]

use std::path::Path;

use assert_cmd::Command;
use livecal::CalibrationFile;
use predicates::prelude::*;

fn write_gradient_png(path: &Path, w: u32, h: u32) {
    let img = image::RgbImage::from_fn(w, h, |x, y| {
        image::Rgb([(x * 255 / w) as u8, (y * 255 / h) as u8, 128])
    });
    img.save(path).expect("write png");
}

fn write_calibration(path: &Path, width: i64, height: i64) {
    CalibrationFile {
        width,
        height,
        fisheye: false,
        alpha: 0.0,
        camera_matrix: [
            [80.0, 0.0, width as f64 / 2.0],
            [0.0, 80.0, height as f64 / 2.0],
            [0.0, 0.0, 1.0],
        ],
        dist_coeffs: vec![-0.05, 0.0, 0.0, 0.0],
    }
    .save(path)
    .expect("write calibration");
}

fn livecal() -> Command {
    Command::cargo_bin("livecal").expect("binary")
}

#[test]
fn undistort_writes_image_of_same_size() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.png");
    let output = dir.path().join("out.png");
    let calib = dir.path().join("camera.json");
    write_gradient_png(&input, 64, 48);
    write_calibration(&calib, 64, 48);

    livecal()
        .arg("undistort")
        .arg("--calibration")
        .arg(&calib)
        .arg("--input")
        .arg(&input)
        .arg("--output")
        .arg(&output)
        .assert()
        .success();

    let out = image::open(&output).expect("output image").to_rgb8();
    assert_eq!(out.dimensions(), (64, 48));
}

#[test]
fn undistort_rejects_other_resolution() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.png");
    let calib = dir.path().join("camera.json");
    write_gradient_png(&input, 64, 48);
    write_calibration(&calib, 1280, 720);

    livecal()
        .args(["undistort", "--calibration"])
        .arg(&calib)
        .arg("--input")
        .arg(&input)
        .arg("--output")
        .arg(dir.path().join("out.png"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("calibration is for 1280x720"));
    assert!(!dir.path().join("out.png").exists());
}

#[test]
fn calibrate_without_boards_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let images: Vec<_> = (0..3)
        .map(|i| {
            let p = dir.path().join(format!("blank{i}.png"));
            write_gradient_png(&p, 96, 64);
            p
        })
        .collect();
    let out = dir.path().join("camera.json");

    livecal()
        .arg("calibrate")
        .args(&images)
        .arg("--out")
        .arg(&out)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no calibration"));
    assert!(!out.exists());
}

#[test]
fn calibrate_requires_images() {
    livecal()
        .args(["calibrate", "--out", "camera.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("required"));
}
