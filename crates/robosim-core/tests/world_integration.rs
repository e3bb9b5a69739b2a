//! End-to-end scenarios across the replication boundary: an authoritative
//! environment instance, plus actor/viewer instances kept in sync purely by
//! applying the command stream.

use approx::assert_abs_diff_eq;
use robosim_core::{
    Action, DoorSpec, Drive, EntityId, EntitySpec, EntityType, Owner, ParentRef, Point,
    Pushability, Shape, ShapeSpec, StartPlacement, WorldCommand, WorldConfig, WorldModel,
};
use std::f64::consts::FRAC_PI_2;

fn environment() -> WorldModel {
    WorldModel::new(WorldConfig::default(), Owner::Environment).expect("valid default config")
}

fn viewer() -> WorldModel {
    WorldModel::new(WorldConfig::default(), Owner::Viewer).expect("valid default config")
}

fn block(id: u64, x: f64, y: f64) -> EntitySpec {
    let shape = Shape::rectangle(Point::new(x, y), 1.0, 1.0, 0.0, None).unwrap();
    EntitySpec {
        id: EntityId(id),
        name: None,
        entity_type: EntityType::Block,
        color: None,
        laser_visible: true,
        shape: ShapeSpec::from_shape(&shape),
        door: None,
        open: None,
        contents: Vec::new(),
    }
}

fn push_to_open_door(id: u64, pivot: (f64, f64)) -> EntitySpec {
    let door = DoorSpec {
        pivot,
        closed_angle: 0.0,
        pivot_angle: FRAC_PI_2,
        width: 1.0,
        thickness: 0.1,
        open_fraction: 0.0,
    };
    EntitySpec {
        id: EntityId(id),
        name: Some("entrance".into()),
        entity_type: EntityType::Door,
        color: None,
        laser_visible: true,
        shape: ShapeSpec {
            points: vec![pivot, (pivot.0 + 1.0, pivot.1)],
            z: 0.0,
            z_len: None,
            // An open-door action on the door's own shape marks it
            // push-to-open.
            actions: vec![Action::OpenDoor { door: EntityId(id) }],
            pushability: Some(Pushability::Door),
        },
        door: Some(door),
        open: None,
        contents: Vec::new(),
    }
}

/// Replay every command the environment emitted into a follower instance.
fn replicate(events: &[WorldCommand], follower: &mut WorldModel) {
    for command in events {
        follower
            .apply_command(command.clone())
            .expect("replicated command applies cleanly");
    }
}

#[test]
fn pushed_block_replicates_to_a_viewer() {
    let mut env = environment();
    let mut viewer = viewer();
    env.insert_spec(block(10, 10.95, 10.0), ParentRef::Root).unwrap();
    viewer.insert_spec(block(10, 10.95, 10.0), ParentRef::Root).unwrap();

    env.attach_robot("robo", Point::new(10.0, 10.0), 0.0).unwrap();
    env.set_drive(Drive { speed: 1.0, turn_rate: 0.0 }).unwrap();
    let events = env.tick(true).unwrap();
    assert!(events.robot_moved);
    replicate(&events.commands, &mut viewer);

    let env_center = env
        .entity(env.find(EntityId(10)).unwrap())
        .unwrap()
        .shape()
        .center();
    let viewer_center = viewer
        .entity(viewer.find(EntityId(10)).unwrap())
        .unwrap()
        .shape()
        .center();
    assert_abs_diff_eq!(env_center.x, viewer_center.x, epsilon = 1e-9);
    assert_abs_diff_eq!(env_center.y, viewer_center.y, epsilon = 1e-9);
    assert_abs_diff_eq!(env_center.x, 11.05, epsilon = 1e-9);
}

#[test]
fn driving_into_a_push_to_open_door_opens_it() {
    let mut env = environment();
    env.insert_spec(push_to_open_door(20, (5.0, 10.0)), ParentRef::Root).unwrap();
    // Closed leaf spans x 5..6 around y = 10; approach slightly below the
    // pivot line so the open leaf (swung to +y) leaves the path clear.
    env.attach_robot("robo", Point::new(4.3, 9.57), 0.0).unwrap();
    env.set_drive(Drive { speed: 1.0, turn_rate: 0.0 }).unwrap();

    let mut opened = false;
    for _ in 0..60 {
        env.tick(true).unwrap();
        let door = env
            .entity(env.find(EntityId(20)).unwrap())
            .unwrap()
            .door()
            .unwrap()
            .clone();
        if door.open_fraction() >= 1.0 {
            opened = true;
            break;
        }
    }
    assert!(opened, "door never finished opening");

    // With the leaf swung aside the robot eventually passes the pivot line.
    for _ in 0..60 {
        env.tick(true).unwrap();
    }
    assert!(env.robot().unwrap().location().x > 5.5);
}

#[test]
fn door_without_push_action_blocks_the_robot() {
    let mut env = environment();
    let mut door = push_to_open_door(21, (5.0, 10.0));
    door.shape.actions.clear();
    env.insert_spec(door, ParentRef::Root).unwrap();
    env.attach_robot("robo", Point::new(4.3, 9.57), 0.0).unwrap();
    env.set_drive(Drive { speed: 1.0, turn_rate: 0.0 }).unwrap();

    for _ in 0..30 {
        env.tick(true).unwrap();
    }
    let state = env
        .entity(env.find(EntityId(21)).unwrap())
        .unwrap()
        .door()
        .unwrap()
        .clone();
    assert_abs_diff_eq!(state.open_fraction(), 0.0, epsilon = 1e-9);
    // Robot body (radius 0.4) stopped short of the closed leaf.
    assert!(env.robot().unwrap().location().x < 4.9);
}

#[test]
fn welcome_package_bootstraps_an_actor() {
    let mut config = WorldConfig::default();
    config.placements.insert(
        "newcomer".into(),
        StartPlacement {
            location: (3.0, 3.0),
            heading: FRAC_PI_2,
            // The joiner starts out holding a toolbox of its own.
            carried: vec![block(31, 3.2, 3.0)],
        },
    );
    let mut env = WorldModel::new(config.clone(), Owner::Environment).unwrap();
    env.insert_spec(block(30, 8.0, 8.0), ParentRef::Root).unwrap();
    env.attach_robot("host", Point::new(10.0, 10.0), 0.0).unwrap();
    env.register_peer(
        "other",
        Shape::regular_polygon(Point::new(6.0, 6.0), 0.4, 12, 0.0, Some(0.5)).unwrap(),
    );

    let package = env.welcome_package("newcomer");

    // The joiner rebuilds a world from the package alone. Boundary walls are
    // part of the snapshot, so it starts from an empty arena.
    let mut actor = WorldModel::new(config, Owner::Actor).unwrap();
    for spec in &package.entities {
        if actor.find(spec.id).is_none() {
            actor.insert_spec(spec.clone(), ParentRef::Root).unwrap();
        }
    }
    for (name, shape) in &package.peers {
        let shape = shape
            .to_shape(actor.config().robot_z_len, Pushability::Fixed)
            .unwrap();
        actor.register_peer(name.clone(), shape);
    }
    let placement = package.placement.expect("placement configured");
    actor.apply_placement("newcomer", &placement).unwrap();

    // Everything the environment knew, plus the carried bootstrap entity.
    assert_eq!(actor.entity_count(), env.entity_count() + 1);
    assert_eq!(actor.peer_shapes().len(), 1);
    assert_abs_diff_eq!(actor.robot().unwrap().heading(), FRAC_PI_2, epsilon = 1e-9);
    let carried = actor.find(EntityId(31)).expect("carried entity inserted");
    assert!(actor.is_carried(carried));
}

#[test]
fn guestbook_arrival_is_visible_to_the_next_tick() {
    let mut env = environment();
    env.announce_arrival(block(40, 5.0, 5.0), ParentRef::Root);
    env.announce_arrival(block(41, 6.0, 6.0), ParentRef::Root);
    assert_eq!(env.entity_count(), 4);
    env.tick(false).unwrap();
    assert_eq!(env.entity_count(), 6);
    assert!(env.find(EntityId(40)).is_some());
    assert!(env.find(EntityId(41)).is_some());
}

#[test]
fn robot_pose_commands_maintain_the_peer_map() {
    let env = environment();
    let pose = Shape::regular_polygon(Point::new(4.0, 4.0), 0.4, 12, 0.0, Some(0.5)).unwrap();
    let mut follower = viewer();
    follower
        .apply_command(WorldCommand::RobotPose {
            name: "other".into(),
            shape: ShapeSpec::from_shape(&pose),
        })
        .unwrap();
    assert_eq!(follower.peer_shapes().len(), 1);
    assert!(env.peer_shapes().is_empty());
    follower.remove_peer("other");
    assert!(follower.peer_shapes().is_empty());
}

#[test]
fn laser_sees_peer_robots() {
    let mut env = environment();
    env.attach_robot("robo", Point::new(10.0, 10.0), 0.0).unwrap();
    env.register_peer(
        "other",
        Shape::regular_polygon(Point::new(13.0, 10.0), 0.4, 12, 0.0, Some(0.5)).unwrap(),
    );
    env.tick(false).unwrap();
    let scan = env.robot().unwrap().scan().unwrap();
    // Mount at x = 10.3; the peer's near edge sits just inside x = 12.6.
    let center = scan.distances[7];
    assert!(center < 2.4, "peer not detected: {center}");
    assert!(center > 2.2, "peer implausibly close: {center}");
}

#[test]
fn carried_cargo_travels_across_ticks() {
    let mut env = environment();
    env.attach_robot("robo", Point::new(5.0, 10.0), 0.0).unwrap();
    let key = env.insert_spec(block(50, 5.8, 10.0), ParentRef::Carried).unwrap();
    env.set_drive(Drive { speed: 1.0, turn_rate: 0.0 }).unwrap();
    for _ in 0..10 {
        env.tick(true).unwrap();
    }
    let center = env.entity(key).unwrap().shape().center();
    assert_abs_diff_eq!(center.x, 6.8, epsilon = 1e-6);
    assert_abs_diff_eq!(env.robot().unwrap().location().x, 6.0, epsilon = 1e-6);
}

#[test]
fn full_remove_and_upsert_cycle_replicates() {
    let mut env = environment();
    let mut follower = viewer();
    let spec = block(60, 7.0, 7.0);
    for world in [&mut env, &mut follower] {
        world
            .apply_command(WorldCommand::UpsertEntity {
                spec: spec.clone(),
                parent: ParentRef::Root,
            })
            .unwrap();
    }
    let moved = env
        .apply_command(WorldCommand::Translate {
            id: EntityId(60),
            dx: 2.0,
            dy: 0.0,
            dz: 0.0,
        })
        .unwrap();
    replicate(&moved, &mut follower);
    let a = env.entity(env.find(EntityId(60)).unwrap()).unwrap().shape().center();
    let b = follower
        .entity(follower.find(EntityId(60)).unwrap())
        .unwrap()
        .shape()
        .center();
    assert_abs_diff_eq!(a.x, b.x, epsilon = 1e-9);

    for world in [&mut env, &mut follower] {
        world
            .apply_command(WorldCommand::RemoveEntity { id: EntityId(60) })
            .unwrap();
    }
    assert!(env.find(EntityId(60)).is_none());
    assert!(follower.find(EntityId(60)).is_none());
}
