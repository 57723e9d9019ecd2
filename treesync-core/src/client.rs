use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::{Client, Response};
use url::Url;

use crate::connector::{
    ByteStream, ConnectionParams, Connector, RemoteConnection, RemoteEntry, RemoteError,
};

/// HTTP dialect of the remote file server:
///
/// - `GET  /api/session`            — handshake / credential check
/// - `GET  /api/list?path=`         — JSON array of entries (empty when missing)
/// - `GET  /api/file?path=`         — file content
/// - `PUT  /api/file?path=`         — streamed upload
/// - `DELETE /api/file?path=`       — delete a file
/// - `PUT  /api/folder?path=`       — create a folder (with intermediates)
/// - `DELETE /api/folder?path=`     — remove a folder recursively
pub struct HttpConnector;

#[async_trait]
impl Connector for HttpConnector {
    type Conn = HttpConnection;

    async fn connect(&self, params: &ConnectionParams) -> Result<HttpConnection, RemoteError> {
        let conn = HttpConnection {
            http: Client::new(),
            base: Url::parse(&params.endpoint)?,
            username: params.username.clone(),
            password: params.password.clone(),
        };
        conn.handshake().await?;
        Ok(conn)
    }
}

#[derive(Debug)]
pub struct HttpConnection {
    http: Client,
    base: Url,
    username: String,
    password: String,
}

impl HttpConnection {
    async fn handshake(&self) -> Result<(), RemoteError> {
        let url = self.base.join("/api/session")?;
        let response = self.request(self.http.get(url)).await?;
        Self::check_status(response).await?;
        Ok(())
    }

    fn endpoint(&self, api: &str, path: &str) -> Result<Url, RemoteError> {
        let mut url = self.base.join(api)?;
        url.query_pairs_mut().append_pair("path", path);
        Ok(url)
    }

    async fn request(&self, builder: reqwest::RequestBuilder) -> Result<Response, RemoteError> {
        Ok(builder
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?)
    }

    async fn check_status(response: Response) -> Result<Response, RemoteError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let code = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            Err(RemoteError::Reply { code, message })
        }
    }
}

#[async_trait]
impl RemoteConnection for HttpConnection {
    async fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let url = self.endpoint("/api/list", path)?;
        let response = Self::check_status(self.request(self.http.get(url)).await?).await?;
        Ok(response.json::<Vec<RemoteEntry>>().await?)
    }

    async fn retrieve(&mut self, path: &str) -> Result<ByteStream, RemoteError> {
        let url = self.endpoint("/api/file", path)?;
        let response = Self::check_status(self.request(self.http.get(url)).await?).await?;
        Ok(response
            .bytes_stream()
            .map_err(RemoteError::from)
            .boxed())
    }

    async fn store(&mut self, path: &str, body: ByteStream, _len: u64) -> Result<(), RemoteError> {
        let url = self.endpoint("/api/file", path)?;
        let response = self
            .request(self.http.put(url).body(reqwest::Body::wrap_stream(body)))
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn delete_file(&mut self, path: &str) -> Result<(), RemoteError> {
        let url = self.endpoint("/api/file", path)?;
        let response = self.request(self.http.delete(url)).await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn make_dir(&mut self, path: &str) -> Result<(), RemoteError> {
        let url = self.endpoint("/api/folder", path)?;
        let response = self.request(self.http.put(url)).await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn remove_dir(&mut self, path: &str) -> Result<(), RemoteError> {
        let url = self.endpoint("/api/folder", path)?;
        let response = self.request(self.http.delete(url)).await?;
        Self::check_status(response).await?;
        Ok(())
    }
}
