use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    crowdbox::apps::run_replay_aggregator(std::env::args().skip(1))
}
