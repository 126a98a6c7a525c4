use crate::PER_PAGE;
use cloudflare::framework::endpoint::{Endpoint, Method};
use cloudflare::framework::response::ApiResult;
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AccessApplication {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub domain: Option<String>,
}

impl ApiResult for AccessApplication {}

pub mod list_applications {
    use super::*;

    pub struct ListAccessApplications<'a> {
        pub account_identifier: &'a str,
        pub page: u32,
    }

    impl Endpoint<Vec<AccessApplication>> for ListAccessApplications<'_> {
        fn method(&self) -> Method {
            Method::GET
        }
        fn path(&self) -> String {
            format!("accounts/{}/access/apps", self.account_identifier)
        }
        fn query(&self) -> Option<String> {
            Some(format!("page={}&per_page={PER_PAGE}", self.page))
        }
    }
}

pub mod create_application {
    use super::*;

    /// Creates a self-hosted Access application guarding `domain`.
    pub struct CreateSelfHostedApplication<'a> {
        pub account_identifier: &'a str,
        pub name: &'a str,
        pub domain: &'a str,
    }

    impl Endpoint<AccessApplication> for CreateSelfHostedApplication<'_> {
        fn method(&self) -> Method {
            Method::POST
        }
        fn path(&self) -> String {
            format!("accounts/{}/access/apps", self.account_identifier)
        }
        fn body(&self) -> Option<String> {
            let body = json!({
                "name": self.name,
                "domain": self.domain,
                "type": "self_hosted",
            });
            Some(body.to_string())
        }
    }
}
