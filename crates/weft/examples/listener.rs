// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Prints every string published on `/chatter`.

use weft::{logging, Node, Result};

fn main() -> Result<()> {
    logging::init();
    let node = Node::new()?;

    node.subscribe("/chatter", |msg: &String, info| {
        println!("heard on {}: {}", info.topic, msg);
    })?;

    println!("listening on /chatter, ctrl-c to quit");
    loop {
        std::thread::park();
    }
}
