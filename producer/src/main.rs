use clap::Parser;
use serde_derive::{Deserialize, Serialize};

use shmq::{Segment, ShmQueue, ShmqConfig};
use std::error::Error;
use std::time::Instant;

#[derive(Parser)]
#[command(about = "Push a numbered message sequence through the shared-memory queue")]
struct Opts {
    #[arg(short = 'c', long = "config", default_value = "shmq-producer.toml")]
    config: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProducerConfig {
    shmq: ShmqConfig,
    messages: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        ProducerConfig {
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
    let cfg: ProducerConfig = confy::load_path(&opts.config)?;

    let mut segment = Segment::open(&cfg.shmq.segment_name)?;
    {
        let mut queue = ShmQueue::<Message>::attach(&mut segment, cfg.shmq.initial_capacity)?;
        run(&mut queue, cfg.messages)?;
    }
    segment.unlink();
    Ok(())
}

fn run(queue: &mut ShmQueue<Message>, messages: u64) -> Result<(), Box<dyn Error>> {
    println!("Producer starting up");
    let start = Instant::now();

    for seq in 0..messages {
        if seq % 1_000_000 == 0 {
            println!("seq: {}", seq);
        }
        let message = Message { words: [seq; 8] };
        if !queue.push(message, true) {
            return Err(format!("queue grow failed at seq {}", seq).into());
        }
    }

    println!(
        "pushed {} messages in {:#?}, final capacity {}",
        messages,
        start.elapsed(),
        queue.capacity()
    );
    Ok(())
}
