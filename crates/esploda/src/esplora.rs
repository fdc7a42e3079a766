//! An implementation of the Esplora protocol. The main type is the [`Esplora`] client.

pub use self::tx::{Error, Status, Transaction, TxIn, TxOut};
use crate::{append_path, Req};
use bitcoin::Txid;
use http::{Request, Uri};
use thiserror::Error;

mod tx;

/// Errors raised while configuring the API root.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid Esplora URI")]
    Http(#[from] http::Error),

    /// Relative and non-network URIs like `/hello/world` or `mailto:` cannot be fetched.
    #[error("Esplora URI must have a scheme and host: `{0}`")]
    Relative(String),
}

/// Request builder for one Esplora API server.
#[derive(Clone, Debug)]
pub struct Esplora {
    req: Req,
}

impl Esplora {
    /// Esplora client constructor.
    ///
    /// The API endpoint string must be a valid absolute [`Uri`] with a scheme and host.
    ///
    /// # Example
    ///
    /// ```
    /// # use esploda::esplora::Esplora;
    /// let esplora = Esplora::new("https://mempool.space/api/").unwrap();
    /// assert_eq!(esplora.host(), Some("mempool.space"));
    /// ```
    pub fn new<U>(api: U) -> Result<Self, ApiError>
    where
        U: TryInto<Uri>,
        <U as TryInto<Uri>>::Error: Into<http::Error>,
    {
        let req = Request::get(api).body(())?;
        if req.uri().scheme().is_none() || req.uri().host().is_none() {
            return Err(ApiError::Relative(req.uri().to_string()));
        }

        Ok(Self { req })
    }

    /// The host name of the API server, used for provenance tags.
    pub fn host(&self) -> Option<&str> {
        self.req.uri().host()
    }

    /// Get a [`Transaction`] by [`Txid`].
    ///
    /// Returns a [`Req`] which can be sent by your preferred HTTP client. The response can be
    /// deserialized from JSON into a [`Transaction`].
    pub fn get_tx(&self, txid: Txid) -> Result<Req, http::Error> {
        let mut req = self.req.clone();
        append_path(&mut req, &format!("tx/{txid}"))?;

        Ok(req)
    }

    /// Get the height of the chain tip.
    ///
    /// The response body is the height as plain text.
    pub fn get_tip_height(&self) -> Result<Req, http::Error> {
        let mut req = self.req.clone();
        append_path(&mut req, "blocks/tip/height")?;

        Ok(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_tx() {
        let client = Esplora::new("https://mempool.space/api/").unwrap();
        let txid = "7a23e9ffacfe08ad6c942aeb0eb94a1653804e40c12babdbd10468d3886f3e74";
        let req = client.get_tx(txid.parse().unwrap()).unwrap();
        let uri = req.uri();

        assert_eq!(uri.scheme_str(), Some("https"));
        assert_eq!(uri.host(), Some("mempool.space"));
        assert_eq!(
            uri.path(),
            "/api/tx/7a23e9ffacfe08ad6c942aeb0eb94a1653804e40c12babdbd10468d3886f3e74"
        );
        assert!(uri.query().is_none());
    }

    #[test]
    fn test_root_without_trailing_slash() {
        let client = Esplora::new("https://blockstream.info/api").unwrap();
        let txid = "5ad16406d77dfcb36c6a21290fc86771d038f08609efc40ddbf4a1bf2e9d80d9";
        let req = client.get_tx(txid.parse().unwrap()).unwrap();

        assert_eq!(
            req.uri().path(),
            "/api/tx/5ad16406d77dfcb36c6a21290fc86771d038f08609efc40ddbf4a1bf2e9d80d9"
        );
    }

    #[test]
    fn test_empty_path() {
        let client = Esplora::new("http://localhost:3001").unwrap();
        let txid = "5ad16406d77dfcb36c6a21290fc86771d038f08609efc40ddbf4a1bf2e9d80d9";
        let req = client.get_tx(txid.parse().unwrap()).unwrap();
        let uri = req.uri();

        assert_eq!(uri.host(), Some("localhost"));
        assert_eq!(uri.port_u16(), Some(3001));
        assert_eq!(
            uri.path(),
            "/tx/5ad16406d77dfcb36c6a21290fc86771d038f08609efc40ddbf4a1bf2e9d80d9"
        );
    }

    #[test]
    fn test_get_tip_height() {
        let client = Esplora::new("https://mempool.space/api/").unwrap();
        let req = client.get_tip_height().unwrap();

        assert_eq!(req.uri().path(), "/api/blocks/tip/height");
    }

    #[test]
    fn test_relative_uri_rejected() {
        assert!(matches!(
            Esplora::new("/just/a/path"),
            Err(ApiError::Relative(_))
        ));
    }
}
