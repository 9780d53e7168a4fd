//! HTTP URL ACL reservations through `netsh`

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::tool::{resolve_tool, run_tool};

use super::UrlAclTool;

pub struct NetshUrlAcl {
    netsh_path: PathBuf,
}

impl NetshUrlAcl {
    pub fn new() -> Self {
        Self {
            netsh_path: resolve_tool("netsh.exe"),
        }
    }

    pub fn url(port: u16) -> String {
        format!("http://*:{}/", port)
    }

    pub fn add_args(port: u16, principal: &str) -> Vec<String> {
        vec![
            "http".to_string(),
            "add".to_string(),
            "urlacl".to_string(),
            format!("url={}", Self::url(port)),
            format!("user={}", principal),
        ]
    }

    pub fn delete_args(port: u16) -> Vec<String> {
        vec![
            "http".to_string(),
            "delete".to_string(),
            "urlacl".to_string(),
            format!("url={}", Self::url(port)),
        ]
    }
}

impl Default for NetshUrlAcl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UrlAclTool for NetshUrlAcl {
    async fn add_rule(&self, port: u16, principal: &str) -> Result<()> {
        run_tool(&self.netsh_path, &Self::add_args(port, principal)).await?;
        info!(port, principal = %principal, "URL ACL added");
        Ok(())
    }

    async fn delete_rule(&self, port: u16) -> Result<()> {
        run_tool(&self.netsh_path, &Self::delete_args(port)).await?;
        info!(port, "URL ACL deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_add_rule_arguments() {
        assert_eq!(
            NetshUrlAcl::add_args(8888, "c_094850238").join(" "),
            "http add urlacl url=http://*:8888/ user=c_094850238"
        );
    }

    #[test]
    fn test_delete_rule_arguments() {
        assert_eq!(
            NetshUrlAcl::delete_args(8888).join(" "),
            "http delete urlacl url=http://*:8888/"
        );
    }
}
