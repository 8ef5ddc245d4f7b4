// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Serves `/echo`, and calls it once from a second node to show both ends.

use std::time::Duration;

use weft::{logging, Node, Result};

fn main() -> Result<()> {
    logging::init();
    let responder = Node::new()?;
    responder.advertise_service("/echo", |req: String| {
        println!("serving echo for {:?}", req);
        Some(req)
    })?;

    let caller = Node::new()?;
    let reply: String = caller.request("/echo", &"ping".to_string(), Duration::from_secs(5))?;
    println!("got back: {}", reply);

    println!("still serving /echo, ctrl-c to quit");
    loop {
        std::thread::park();
    }
}
