mod common;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use shardcore::world::entity::{Direction, Location, Parent};
use shardcore::world::serial::Serial;
use shardcore::world::visibility::{ConnectionId, Delivery, ObserverSink, VisibilityEvent};
use shardcore::world::World;

use common::{assert_consistent, small_world};

type Log = Arc<Mutex<Vec<(ConnectionId, VisibilityEvent)>>>;

struct SharedSink(Log);

impl ObserverSink for SharedSink {
    fn deliver(&mut self, connection: ConnectionId, event: &VisibilityEvent) -> Delivery {
        self.0.lock().expect("log lock").push((connection, event.clone()));
        Delivery::Delivered
    }
}

/// Placed entities within the observer's radius, computed the slow way.
fn expected_visible(world: &World, observer: Serial) -> BTreeSet<Serial> {
    let me = world.find(observer).expect("observer exists");
    let radius = world.visibility().get(observer).expect("attached").radius;
    let geometry = world.settings().geometry;
    world
        .entities()
        .filter(|e| e.serial() != observer && e.parent() == Parent::World)
        .filter(|e| geometry.distance(me.location(), e.location()) <= radius)
        .map(|e| e.serial())
        .collect()
}

/// Replays the event log per connection, failing on redundant enters or exits.
fn replay(log: &Log, views: &mut HashMap<ConnectionId, BTreeSet<Serial>>) {
    let drained: Vec<_> = std::mem::take(&mut *log.lock().expect("log lock"));
    for (connection, event) in drained {
        let view = views.entry(connection).or_default();
        match event {
            VisibilityEvent::Enter { subject, .. } => {
                assert!(view.insert(subject), "{} entered twice on {}", subject, connection);
            }
            VisibilityEvent::Update { subject, .. } => {
                assert!(view.contains(&subject), "update for unseen {}", subject);
            }
            VisibilityEvent::Exit { subject } => {
                assert!(view.remove(&subject), "{} left without entering", subject);
            }
        }
    }
}

#[test]
fn visible_sets_track_random_walks() {
    let mut rng = StdRng::seed_from_u64(0x5EED);
    let log: Log = Arc::default();
    let mut world = small_world();
    world.replace_sink(Box::new(SharedSink(log.clone())));

    let mut mobiles = Vec::new();
    for _ in 0..24 {
        let at = Location::new(rng.gen_range(0..40), rng.gen_range(0..40), 0);
        mobiles.push(world.create_entity_at("human", at).expect("human"));
    }
    for _ in 0..30 {
        let at = Location::new(rng.gen_range(0..40), rng.gen_range(0..40), 0);
        world.create_entity_at("dagger", at).expect("dagger");
    }

    let observers: Vec<(Serial, ConnectionId)> = mobiles
        .iter()
        .take(6)
        .enumerate()
        .map(|(i, m)| (*m, i as ConnectionId + 1))
        .collect();
    for (mobile, connection) in &observers {
        let radius = rng.gen_range(0..20);
        let clamped = world
            .attach_observer(*mobile, *connection, Some(radius))
            .expect("attach");
        assert!((2..=12).contains(&clamped));
    }

    let mut views = HashMap::new();
    for step in 0..2000 {
        let mover = mobiles[rng.gen_range(0..mobiles.len())];
        match rng.gen_range(0..20) {
            0 => {
                let to = Location::new(rng.gen_range(0..64), rng.gen_range(0..64), 0);
                world.teleport(mover, to);
            }
            1 => {
                let (observer, _) = observers[rng.gen_range(0..observers.len())];
                world.set_view_radius(observer, rng.gen_range(0..16));
            }
            _ => {
                let direction = Direction::ALL[rng.gen_range(0..8)];
                assert!(world.move_entity(mover, direction));
            }
        }

        replay(&log, &mut views);
        for (mobile, connection) in &observers {
            let expected = expected_visible(&world, *mobile);
            let reported: BTreeSet<Serial> = world
                .visible_to(*mobile)
                .expect("attached")
                .into_iter()
                .collect();
            assert_eq!(reported, expected, "step {} observer {}", step, mobile);
            let replayed = views.get(connection).cloned().unwrap_or_default();
            assert_eq!(replayed, expected, "event stream diverged at step {}", step);
        }
    }
    assert_consistent(&world);
}

#[test]
fn entities_leaving_the_map_exit_and_returning_ones_enter() {
    let log: Log = Arc::default();
    let mut world = small_world();
    world.replace_sink(Box::new(SharedSink(log.clone())));

    let watcher = world
        .create_entity_at("human", Location::new(20, 20, 0))
        .expect("watcher");
    let bystander = world
        .create_entity_at("human", Location::new(22, 20, 0))
        .expect("bystander");
    let bag = world.create_entity_at("bag", Location::new(21, 21, 0)).expect("bag");
    let far = world.create_entity_at("dagger", Location::new(90, 90, 0)).expect("far");
    world.attach_observer(watcher, 7, Some(6)).expect("attach");

    let mut views = HashMap::new();
    replay(&log, &mut views);
    assert_eq!(
        views.get(&7).cloned().unwrap_or_default(),
        [bystander, bag].into_iter().collect::<BTreeSet<_>>()
    );

    // picked up: leaves the map, so the watcher loses sight of it
    world.add_child(bag, far).expect("into bag");
    world.set_parent(bag, Parent::Entity(bystander)).expect_err("bags are not worn");
    let backpack = world.create_entity_at("backpack", Location::new(21, 20, 0)).expect("pack");
    world.equip(bystander, backpack, shardcore::world::equipment::Layer::Backpack).expect("equip");
    world.add_child(backpack, bag).expect("bag into backpack");
    replay(&log, &mut views);
    assert_eq!(views[&7], [bystander].into_iter().collect::<BTreeSet<_>>());

    world.remove_child(backpack, bag).expect("drop bag");
    replay(&log, &mut views);
    assert_eq!(views[&7], [bystander, bag].into_iter().collect::<BTreeSet<_>>());
    assert_eq!(world.find(bag).map(|e| e.location()), Some(Location::new(22, 20, 0)));

    assert!(world.destroy(bystander));
    replay(&log, &mut views);
    assert_eq!(views[&7], [bag].into_iter().collect::<BTreeSet<_>>());
    assert_consistent(&world);
}

#[test]
fn destroying_an_observer_queues_its_disconnect() {
    let mut world = small_world();
    let mobile = world.create_entity_at("human", Location::new(5, 5, 0)).expect("human");
    world.attach_observer(mobile, 42, None).expect("attach");
    assert!(world.destroy(mobile));
    assert_eq!(world.take_disconnects(), vec![42]);
    assert!(world.visibility().is_empty());
}
