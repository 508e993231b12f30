use approx::assert_relative_eq;
use kinema3d::kinematics::{BodyDesc, GripDesc, Joint, Model, SolverParams};
use kinema3d::math::Vec3;
use kinema3d::track::ArcLinTrack;
use std::f64::consts::TAU;

const RADIUS: f64 = 10.0;

fn circle(n: usize) -> Vec<Vec3> {
    (0..n)
        .map(|i| {
            let a = i as f64 * TAU / n as f64;
            Vec3::new(RADIUS * a.cos(), RADIUS * a.sin(), 0.0)
        })
        .collect()
}

#[test]
fn wheel_rides_on_the_rail() -> anyhow::Result<()> {
    let mut model = Model::new();
    let ground = model.add_body(BodyDesc::ground("ground"))?;
    let bogie = model.add_body(BodyDesc::new("bogie"))?;
    let rail = model.add_track("rail", ArcLinTrack::from_points(&circle(36), true, 0.1)?)?;
    let wheel =
        model.add_grip(GripDesc::new("wheel", ground, bogie).joint(Joint::track(rail, 0.45)))?;
    let topo = model.build_topology()?[0];

    let s = 7.0;
    let mut vars = model.var_vec(topo)?;
    vars[0] = s;
    model.joint_mut(wheel)?.set_speed(0, 2.0);
    model.solve_pos(topo, &SolverParams::default(), &mut vars)?;

    // Without a co-track the rail normal points up: the centre rides 0.5 above the rail.
    let track = model.track(rail)?;
    let centre = model.body(bogie)?.pos().origin();
    let expected = track.point_at(s) + Vec3::derivative(0.0, 0.0, 0.5);
    assert_relative_eq!(centre.coords, expected.coords, epsilon = 1.0e-9);

    // Speed along the tangent, scaled by the arclength rate.
    let v = model.body(bogie)?.speed().trans;
    assert_relative_eq!(v, track.dir_at(s).coords * 2.0, epsilon = 1.0e-6);

    // Changing the wheel radius moves the centre but keeps `s`.
    assert!(model.joint_mut(wheel)?.set_wheel_rad(0.95));
    model.update_positions(topo)?;
    assert_eq!(model.joint(wheel)?.value(0), s);
    let raised = model.body(bogie)?.pos().origin();
    assert_relative_eq!(raised.z(), 1.0, epsilon = 1.0e-9);
    Ok(())
}

#[test]
fn wheel_position_seeds_the_arclength() -> anyhow::Result<()> {
    let mut model = Model::new();
    let ground = model.add_body(BodyDesc::ground("ground"))?;
    let bogie = model.add_body(BodyDesc::new("bogie"))?;
    let rail = model.add_track("rail", ArcLinTrack::from_points(&circle(24), true, 0.0)?)?;
    let wheel =
        model.add_grip(GripDesc::new("wheel", ground, bogie).joint(Joint::track(rail, 0.5)))?;
    let topo = model.build_topology()?[0];

    let mut joint = model.joint_mut(wheel)?;
    joint.set_value(0, 20.0);
    joint.set_value(1, 0.04);
    let target = model.joint(wheel)?.pos(model.tracks());
    model.joint_mut(wheel)?.set_value(0, 0.0);
    model.joint_mut(wheel)?.set_value(1, 0.0);
    model.set_body_pos(bogie, target)?;
    model.init_vars_from_pos(topo, false)?;

    let joint = model.joint(wheel)?;
    assert_relative_eq!(joint.value(0), 20.0, epsilon = 1.0e-4);
    assert_relative_eq!(joint.value(1), 0.04, epsilon = 1.0e-4);
    assert!(joint.pos(model.tracks()).relative_eq(&target, 1.0e-4));
    assert_eq!(model.track_by_name("rail")?, rail);
    Ok(())
}
