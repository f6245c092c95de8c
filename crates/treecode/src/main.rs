use std::env;

use log::info;

use treecode::{data, Config, Driver};

fn main() {
    env_logger::init();

    let config = match env::args().nth(1) {
        Some(path) => Config::from_file(&path).expect("config file rejected"),
        None => Config::default(),
    };

    let particles = match &config.input_file {
        Some(path) => data::read_particles(path).expect("particle file rejected"),
        None => data::random_cloud(config.n_particles, config.seed),
    };
    info!(
        "{} particles, {} readers, {} iterations",
        particles.len(),
        config.n_readers,
        config.num_iterations
    );

    let mut driver = Driver::new(config).expect("configuration rejected");
    driver.load(particles).expect("decomposition failed");
    driver.run().expect("run aborted");
}
