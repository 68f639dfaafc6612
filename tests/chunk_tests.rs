use std::path::Path;

use slice_recorder::chunk::{locate, EndBound};
use slice_recorder::codec::DType;
use slice_recorder::slice::{Axis, Slice, SliceIo};
use slice_recorder::Role;

fn io(dir: &Path) -> SliceIo<'_> {
    SliceIo { dir, role: Role::Producer, consistent: true, closed: false, reclaim_memory: false }
}

/// Time slices of three samples each holding `times`.
fn time_axis(times: &[f64]) -> Vec<Slice> {
    times
        .chunks(3)
        .enumerate()
        .map(|(i, chunk)| {
            let mut slice = Slice::new(format!("{:08x}", i), "t", Axis::Time, DType::F64, 24);
            for &t in chunk {
                slice.append(t).unwrap();
            }
            slice
        })
        .collect()
}

#[test]
fn test_locate_across_slices() {
    let dir = tempfile::tempdir().unwrap();
    let times: Vec<f64> = (0..20).map(f64::from).collect();
    let mut slices = time_axis(&times);

    assert_eq!(locate(&mut slices, &io(dir.path()), 3.0, EndBound::Inclusive(23.0)).unwrap(), Some((3, 20)));
    assert_eq!(locate(&mut slices, &io(dir.path()), 4.5, EndBound::Inclusive(7.0)).unwrap(), Some((5, 8)));
    assert_eq!(locate(&mut slices, &io(dir.path()), 0.0, EndBound::Exclusive(6.0)).unwrap(), Some((0, 6)));
    assert_eq!(locate(&mut slices, &io(dir.path()), 0.0, EndBound::Inclusive(6.0)).unwrap(), Some((0, 7)));
}

#[test]
fn test_locate_outside_samples() {
    let dir = tempfile::tempdir().unwrap();
    let mut slices = time_axis(&[1.0, 2.0, 3.0, 4.0]);
    assert_eq!(locate(&mut slices, &io(dir.path()), 10.0, EndBound::Inclusive(20.0)).unwrap(), None);
    assert_eq!(locate(&mut slices, &io(dir.path()), 2.5, EndBound::Exclusive(3.0)).unwrap(), None);
    assert_eq!(locate(&mut Vec::<Slice>::new(), &io(dir.path()), 0.0, EndBound::Inclusive(1.0)).unwrap(), None);
}

#[test]
fn test_locate_with_repeated_times() {
    let dir = tempfile::tempdir().unwrap();
    let mut slices = time_axis(&[0.0, 1.0, 1.0, 1.0, 1.0, 2.0]);
    assert_eq!(locate(&mut slices, &io(dir.path()), 1.0, EndBound::Inclusive(1.0)).unwrap(), Some((1, 5)));
    assert_eq!(locate(&mut slices, &io(dir.path()), 0.0, EndBound::Exclusive(1.0)).unwrap(), Some((0, 1)));
}
