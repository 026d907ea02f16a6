/// Property tests for the kinematic transforms and the bed plane fit
use bolero::check;
use legato_core::{
    axis::AxisVector,
    bed_compensation::{BedCompensationMatrix, HeightSample},
    kinematics::{BeltKin, BeltMatrix, DeltaGeometry, DeltaKin, Kinematics},
};

fn finite_in(value: f64, limit: f64) -> bool {
    value.is_finite() && value.abs() <= limit
}

#[test]
fn belt_round_trip() {
    check!()
        .with_type::<([f64; 5], [[f64; 2]; 2])>()
        .for_each(|(position, matrix)| {
            if !position.iter().all(|v| finite_in(*v, 1.0))
                || !matrix.iter().flatten().all(|v| finite_in(*v, 2.0))
            {
                return;
            }
            let Ok(kin) = BeltKin::new(BeltMatrix(*matrix)) else {
                return;
            };
            let [[a, b], [c, d]] = *matrix;
            let scale = matrix.iter().flatten().fold(0.0_f64, |m, v| m.max(v.abs()));
            if scale < 1e-3 || (a * d - b * c).abs() < 1e-3 * scale * scale {
                return;
            }

            let position = AxisVector(*position);
            let actuators = kin.to_actuator_space(&position).unwrap();
            let back = kin.to_cartesian_space(&actuators).unwrap();
            for (x, y) in back.0.iter().zip(position.0) {
                assert!((x - y).abs() < 1e-9, "{back:?} != {position:?}");
            }
        });
}

#[test]
fn delta_round_trip_inside_envelope() {
    let kin = DeltaKin::new(DeltaGeometry::default()).unwrap();
    check!()
        .with_type::<(f64, f64, f64)>()
        .for_each(|&(x, y, z)| {
            if !(finite_in(x, 0.02) && finite_in(y, 0.02) && finite_in(z, 0.2)) {
                return;
            }
            let position = AxisVector([x, y, z, 0.0, 0.0]);
            let columns = kin.to_actuator_space(&position).unwrap();
            let back = kin.to_cartesian_space(&columns).unwrap();
            for axis in 0..3 {
                assert!(
                    (back.0[axis] - position.0[axis]).abs() < 1e-6,
                    "{back:?} != {position:?}"
                );
            }
        });
}

#[test]
fn delta_rejects_points_outside_rod_reach() {
    let kin = DeltaKin::new(DeltaGeometry::default()).unwrap();
    check!()
        .with_type::<(f64, f64)>()
        .for_each(|&(x, y)| {
            if !(finite_in(x, 10.0) && finite_in(y, 10.0)) || x.hypot(y) < 0.25 {
                return;
            }
            assert!(kin.to_actuator_space(&AxisVector([x, y, 0.0, 0.0, 0.0])).is_err());
        });
}

#[test]
fn plane_fit_reproduces_three_samples() {
    check!()
        .with_type::<[(f64, f64, f64); 3]>()
        .for_each(|points| {
            if !points
                .iter()
                .all(|&(x, y, z)| finite_in(x, 0.2) && finite_in(y, 0.2) && finite_in(z, 0.01))
            {
                return;
            }
            let [(x0, y0, _), (x1, y1, _), (x2, y2, _)] = *points;
            let area = ((x1 - x0) * (y2 - y0) - (x2 - x0) * (y1 - y0)).abs();
            if area < 1e-3 {
                return;
            }

            let samples: Vec<_> = points
                .iter()
                .map(|&(x, y, z)| HeightSample::new(x, y, z))
                .collect();
            let matrix = BedCompensationMatrix::fit_plane(&samples).unwrap();
            for sample in &samples {
                assert!((matrix.offset(sample.x, sample.y) - sample.z).abs() < 1e-9);
            }
        });
}
