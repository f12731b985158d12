use clap::Parser;
use serde_derive::{Deserialize, Serialize};

use shmq::{Segment, ShmQueue, ShmqConfig};
use std::error::Error;
use std::hint;
use std::time::Instant;

#[derive(Parser)]
#[command(about = "Pop and verify the numbered message sequence from the shared-memory queue")]
struct Opts {
    #[arg(short = 'c', long = "config", default_value = "shmq-consumer.toml")]
    config: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConsumerConfig {
    shmq: ShmqConfig,
    messages: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            shmq: ShmqConfig::default(),
            messages: 100_000_000,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Message {
    words: [u64; 8],
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opts: Opts = Opts::parse();
    let cfg: ConsumerConfig = confy::load_path(&opts.config)?;

    let mut segment = Segment::open(&cfg.shmq.segment_name)?;
    {
        let mut queue = ShmQueue::<Message>::attach(&mut segment, cfg.shmq.initial_capacity)?;
        run(&mut queue, cfg.messages)?;
    }
    segment.unlink();
    Ok(())
}

fn run(queue: &mut ShmQueue<Message>, messages: u64) -> Result<(), Box<dyn Error>> {
    println!("Consumer starting up");
    let start = Instant::now();

    let mut out = Message { words: [0; 8] };
    for seq in 0..messages {
        if seq % 1_000_000 == 0 {
            println!("seq: {}", seq);
        }
        while !queue.pop(&mut out) {
            hint::spin_loop();
        }
        for word in out.words.iter() {
            assert_eq!(*word, seq, "payload mismatch at seq {}", seq);
        }
    }

    let duration = start.elapsed();
    let iops = (messages as f64) / (duration.as_millis() as f64) * 1_000f64;
    println!(
        "IOPS : {:#?}K, time: {:#?}, final capacity {}",
        (iops / 1000f64) as u64,
        duration,
        queue.capacity()
    );
    Ok(())
}
