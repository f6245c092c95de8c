//! Decomposition invariants: partition completeness, disjoint
//! coverage of the key space, and termination on degenerate inputs.

use treecode::data::random_cloud;
use treecode::types::point::Particle;
use treecode::types::vector::Vec3;
use treecode::{Config, Driver, TreecodeError};

fn small_config() -> Config {
    Config {
        n_readers: 3,
        max_particles_per_tp: 16,
        decomp_tolerance: 1.0,
        ..Config::default()
    }
}

#[test]
fn splitters_cover_the_key_space_without_gaps() {
    let mut driver = Driver::new(small_config()).unwrap();
    driver.load(random_cloud(200, 1)).unwrap();

    let splitters = driver.splitters();
    assert!(splitters.len() > 1);
    assert_eq!(driver.n_treepieces(), splitters.len());

    // Completeness: counts sum to the universe count.
    let total: usize = splitters.iter().map(|s| s.n_particles).sum();
    assert_eq!(total, 200);

    // Disjointness: strictly increasing starts, each range ending
    // where the next begins, the last one open.
    for pair in splitters.windows(2) {
        assert!(pair[0].from < pair[1].from);
        assert_eq!(pair[0].to, pair[1].from);
    }
    assert_eq!(splitters.first().unwrap().from, 1 << 63);
    assert_eq!(splitters.last().unwrap().to, !0);

    // Every bucket respects the decomposition threshold.
    for s in splitters {
        assert!(s.n_particles <= 16);
    }
}

#[test]
fn mass_is_conserved_across_partitions() {
    let mut driver = Driver::new(small_config()).unwrap();
    driver.load(random_cloud(150, 5)).unwrap();

    assert_eq!(driver.universe().n_particles, 150);
    assert!((driver.universe().total_mass - 150.0).abs() < 1e-9);

    let particles = driver.particles().unwrap();
    assert_eq!(particles.len(), 150);
    let mass: f64 = particles.iter().map(|p| p.mass).sum();
    assert!((mass - driver.universe().total_mass).abs() < 1e-9);
}

#[test]
fn splitter_search_terminates_on_a_degenerate_cluster() {
    // 99 particles share one deep cell; the search must cap at the
    // particle-key depth and emit that cell as an overfull splitter.
    let mut particles: Vec<Particle> = (0..99)
        .map(|id| Particle {
            id,
            position: Vec3::new(0.123456, 0.654321, 0.111111),
            mass: 1.0,
            ..Particle::default()
        })
        .collect();
    particles.push(Particle {
        id: 99,
        position: Vec3::new(0.9, 0.9, 0.9),
        mass: 1.0,
        ..Particle::default()
    });

    let config = Config {
        n_readers: 2,
        max_particles_per_tp: 10,
        decomp_tolerance: 1.0,
        ..Config::default()
    };
    let mut driver = Driver::new(config).unwrap();
    driver.load(particles).unwrap();

    let splitters = driver.splitters();
    let total: usize = splitters.iter().map(|s| s.n_particles).sum();
    assert_eq!(total, 100);

    // The degenerate cell survives over the threshold.
    assert!(splitters.iter().any(|s| s.n_particles == 99));
}

#[test]
fn capacity_overflow_is_fatal() {
    let config = Config {
        n_readers: 2,
        max_particles_per_tp: 2,
        decomp_tolerance: 1.0,
        num_total_treepieces: 4,
        ..Config::default()
    };
    let mut driver = Driver::new(config).unwrap();
    match driver.load(random_cloud(400, 2)) {
        Err(TreecodeError::CapacityOverflow { n_treepieces, limit }) => {
            assert!(n_treepieces > limit);
            assert_eq!(limit, 4);
        }
        other => panic!("expected capacity overflow, got {:?}", other),
    }
}
