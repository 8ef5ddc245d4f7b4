// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Publishes a string on `/chatter` once a second.
//!
//! Run `listener` in another terminal (or on another machine in the same
//! network segment) to see the messages arrive.

use std::time::Duration;

use weft::{logging, Node, Result};

fn main() -> Result<()> {
    logging::init();
    let node = Node::new()?;
    let publisher = node.advertise::<String>("/chatter")?;

    let mut count = 0u64;
    loop {
        let msg = format!("hello fabric {}", count);
        publisher.publish(&msg)?;
        println!("published: {}", msg);
        count += 1;
        std::thread::sleep(Duration::from_secs(1));
    }
}
