//! An [Esplora API] client, [sans I/O]. (Bring your own sync/async HTTP client!)
//!
//! This library covers the protocol layer of Esplora-compatible servers (Blockstream's Esplora
//! and mempool.space both speak it): building requests and deserializing responses. Nothing in
//! here opens a socket.
//!
//! [Esplora API]: https://github.com/Blockstream/esplora/blob/master/API.md
//! [sans I/O]: https://sans-io.readthedocs.io/how-to-sans-io.html
//!
//! # Sync example with `ureq`
//!
//! ```ignore
//! use esploda::esplora::{Esplora, Transaction};
//!
//! let agent = ureq::agent();
//! let esplora = Esplora::new("https://mempool.space/api/")?;
//! let txid = "7a23e9ffacfe08ad6c942aeb0eb94a1653804e40c12babdbd10468d3886f3e74";
//!
//! let mut resp = agent.run(esplora.get_tx(txid.parse()?))?;
//! let tx: Transaction = resp.body_mut().read_json()?;
//!
//! for output in &tx.outputs {
//!     println!("{:?} <- {} sats", output.address, output.value);
//! }
//! ```

#![forbid(unsafe_code)]

pub use bitcoin;
pub use chrono;
pub use http;

pub mod esplora;

pub type Req = http::Request<()>;

/// Append a path to the request URI, keeping any path prefix the API root already has.
pub(crate) fn append_path(req: &mut Req, path: &str) -> Result<(), http::Error> {
    // `http::Uri` has no setter for the path alone.
    // SEE: https://github.com/hyperium/http/issues/594
    let req_uri = req.uri_mut();
    let mut uri_parts = req_uri.clone().into_parts();
    let root = req_uri.path().trim_end_matches('/');
    uri_parts.path_and_query = Some(format!("{root}/{path}").parse()?);
    *req_uri = http::Uri::from_parts(uri_parts)?;

    Ok(())
}
