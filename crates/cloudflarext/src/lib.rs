use cloudflare::framework::{
    auth::Credentials,
    endpoint::Endpoint,
    response::{ApiErrors, ApiFailure, ApiResponse, ApiResult, ApiSuccess},
    Environment, Error, HttpApiClientConfig,
};
use serde_json::Value;
use tracing::debug;

pub mod access;
pub mod cfd_tunnel;

pub const PER_PAGE: u32 = 50;

/// Cloudflare client that carries no credentials of its own; every call is signed with the
/// credentials passed in.
pub struct AuthlessClient {
    environment: Environment,
    http_client: reqwest::Client,
}

impl AuthlessClient {
    pub fn try_default() -> Result<AuthlessClient, Error> {
        Self::try_new(HttpApiClientConfig::default(), Environment::Production)
    }

    pub fn try_new(
        config: HttpApiClientConfig,
        environment: Environment,
    ) -> Result<AuthlessClient, Error> {
        let builder = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .default_headers(config.default_headers);
        let http_client = builder.build()?;
        Ok(AuthlessClient {
            environment,
            http_client,
        })
    }

    pub async fn request<ResultType>(
        &self,
        credentials: &Credentials,
        endpoint: &(dyn Endpoint<ResultType> + Send + Sync),
    ) -> ApiResponse<ResultType>
    where
        ResultType: ApiResult,
    {
        let url = endpoint.url(&self.environment);
        debug!(method = %endpoint.method(), %url, "cloudflare request");
        let mut request = self.http_client.request(endpoint.method(), url);

        if let Some(body) = endpoint.body() {
            request = request.body(body).header(
                reqwest::header::CONTENT_TYPE,
                endpoint.content_type().as_ref(),
            );
        }

        for (key, value) in credentials.headers() {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(ApiFailure::Invalid)?;
        into_api_response(response).await
    }

    /// Walks every page of a listing and concatenates the results. `endpoint` builds the call
    /// for a 1-based page number.
    pub async fn request_pages<Item, PageEndpoint, F>(
        &self,
        credentials: &Credentials,
        mut endpoint: F,
    ) -> Result<Vec<Item>, ApiFailure>
    where
        Vec<Item>: ApiResult,
        PageEndpoint: Endpoint<Vec<Item>> + Send + Sync,
        F: FnMut(u32) -> PageEndpoint,
    {
        let mut items = Vec::new();
        let mut page = 1;
        loop {
            let response = self.request(credentials, &endpoint(page)).await?;
            let fetched = response.result.len();
            items.extend(response.result);

            let total_pages = response
                .result_info
                .as_ref()
                .and_then(|info| info.get("total_pages"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            if fetched == 0 || u64::from(page) >= total_pages {
                return Ok(items);
            }
            page += 1;
        }
    }
}

/// True when `failure` is an API error response whose errors all carry `code`.
pub fn is_api_error(failure: &ApiFailure, code: u32) -> bool {
    let ApiFailure::Error(_, errors) = failure else {
        return false;
    };
    let codes = error_codes(errors);
    !codes.is_empty() && codes.iter().all(|found| *found == u64::from(code))
}

fn error_codes(errors: &ApiErrors) -> Vec<u64> {
    let typed = errors.errors.iter().map(|error| u64::from(error.code));
    let raw = errors
        .other
        .get("errors")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|error| error.get("code").and_then(Value::as_u64));
    typed.chain(raw).collect()
}

async fn into_api_response<ResultType: ApiResult>(
    response: reqwest::Response,
) -> ApiResponse<ResultType> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<ApiSuccess<ResultType>>()
            .await
            .map_err(ApiFailure::Invalid);
    }

    let body = response.json::<Value>().await.unwrap_or_default();
    // Codes wider than the typed error field fail to decode, so keep the raw body around.
    let errors = serde_json::from_value::<ApiErrors>(body.clone()).unwrap_or_else(|_| {
        let mut errors = ApiErrors::default();
        if let Value::Object(fields) = body {
            errors.other.extend(fields);
        }
        errors
    });
    Err(ApiFailure::Error(status, errors))
}
