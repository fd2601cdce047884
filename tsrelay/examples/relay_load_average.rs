use std::time::Duration;

use tsrelay::{DataPoint, PipelineBuilder, TagSet};

fn main() {
    tracing_subscriber::fmt::init();

    let pipeline = PipelineBuilder::default()
        .with_endpoint("http://localhost:4242/api/put")
        .expect("failed to parse endpoint")
        .with_ignore_duplicate(Duration::from_secs(60))
        .with_verbose(true)
        .spawn()
        .expect("failed to spawn pipeline");

    let submitter = pipeline.submitter();
    let tags = TagSet::new().with("host", "localhost");

    // Report a slowly changing value every second. Unchanged repeats are suppressed for a minute.
    for i in 0u64.. {
        let value = (i / 10) as f64 * 0.1;
        match DataPoint::now("example.load", value, tags.clone()) {
            Ok(point) => submitter.submit(point),
            Err(e) => eprintln!("invalid data point: {e}"),
        }

        if i % 30 == 0 {
            println!("{:?}", pipeline.stats());
        }

        std::thread::sleep(Duration::from_secs(1));
    }
}
