//! Remote method invocation over a [`trellis`] connection.
//!
//! An [`ObjectSpace`] exposes local objects by integer id; a [`RemoteObject`]
//! proxy on the other peer marshals typed calls as in-band messages and
//! correlates responses by a 6-bit rolling id. Both peers must call
//! [`register_messages`] at the same point of their registration order and
//! share the same method table per interface.
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use trellis::{Client, Config, Registry, Server};
//! use trellis_rmi::{
//!     Invocable, InvokeFault, ObjectSpace, RemoteObject, decode_args, encode_return,
//!     register_messages,
//! };
//!
//! struct Adder;
//!
//! impl Invocable for Adder {
//!     fn invoke(&self, method: u8, args: &[u8]) -> Result<Vec<u8>, InvokeFault> {
//!         match method {
//!             0 => {
//!                 let (a, b): (i32, i32) = decode_args(args)?;
//!                 encode_return(&(a + b))
//!             }
//!             _ => Err(InvokeFault::new("unknown method")),
//!         }
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = Registry::new();
//! register_messages(&mut registry);
//!
//! let server = Server::new(Config::default(), {
//!     let mut r = Registry::new();
//!     register_messages(&mut r);
//!     r
//! })?;
//! server.bind("0.0.0.0:54555".parse()?, None)?;
//! let space = ObjectSpace::new(0);
//! space.register(42, Arc::new(Adder));
//! server.add_listener(space.listener());
//! server.start()?;
//!
//! let client = Client::new(Config::default(), registry)?;
//! let conn = client.connect("127.0.0.1:54555".parse()?, None, Duration::from_secs(5))?;
//! client.start()?;
//! let adder = RemoteObject::bind(&conn, 0, 42);
//! let sum: i32 = adder.invoke(0, &(2, 3))?;
//! assert_eq!(sum, 5);
//! # Ok(()) }
//! ```

mod error;
pub mod msg;
mod proxy;
mod space;

pub use error::RmiError;
pub use msg::register_messages;
pub use proxy::{PendingResponse, RemoteObject};
pub use space::{Invocable, InvokeFault, ObjectSpace, decode_args, encode_return};
