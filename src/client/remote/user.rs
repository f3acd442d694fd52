use super::RemoteClient;
use crate::client::{ReferentialClient, SettingsClient, UserClient, UserCreation};
use crate::core::error::Result;
use crate::db::models::{Author, ServerSettings, User};
use async_trait::async_trait;
use reqwest::Method;
use serde::Serialize;

#[derive(Serialize)]
struct PasswordUpdate<'a> {
    password: &'a str,
}

#[async_trait]
impl UserClient for RemoteClient {
    async fn get_me(&self) -> Result<User> {
        self.get_json(&["api", "v2", "users", "me"], &[]).await
    }

    async fn get_users(&self) -> Result<Vec<User>> {
        self.get_json(&["api", "v2", "users"], &[]).await
    }

    async fn add_user(&self, user: UserCreation) -> Result<User> {
        self.send_for(Method::POST, &["api", "v2", "users"], &user).await
    }

    async fn delete_user(&self, user_id: &str) -> Result<()> {
        self.send_empty(Method::DELETE, &["api", "v2", "users", user_id], &[]).await
    }

    async fn update_password(&self, user_id: &str, password: &str) -> Result<()> {
        self.send_json(
            Method::PATCH,
            &["api", "v2", "users", user_id, "password"],
            Some(&PasswordUpdate { password }),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SettingsClient for RemoteClient {
    async fn get_server_settings(&self) -> Result<ServerSettings> {
        self.get_json(&["api", "v1", "settings"], &[]).await
    }

    async fn update_server_settings(&self, settings: ServerSettings) -> Result<()> {
        self.send_json(Method::PATCH, &["api", "v1", "settings"], Some(&settings))
            .await?;
        Ok(())
    }
}

fn library_filter(library_id: Option<String>) -> Vec<(&'static str, String)> {
    library_id.map(|id| vec![("library_id", id)]).unwrap_or_default()
}

#[async_trait]
impl ReferentialClient for RemoteClient {
    async fn get_authors(&self, search: Option<String>, library_id: Option<String>) -> Result<Vec<Author>> {
        let mut query = library_filter(library_id);
        if let Some(search) = search {
            query.push(("search", search));
        }
        self.get_json(&["api", "v1", "authors"], &query).await
    }

    async fn get_genres(&self, library_id: Option<String>) -> Result<Vec<String>> {
        self.get_json(&["api", "v1", "genres"], &library_filter(library_id)).await
    }

    async fn get_tags(&self, library_id: Option<String>) -> Result<Vec<String>> {
        self.get_json(&["api", "v1", "tags"], &library_filter(library_id)).await
    }

    async fn get_languages(&self, library_id: Option<String>) -> Result<Vec<String>> {
        self.get_json(&["api", "v1", "languages"], &library_filter(library_id)).await
    }

    async fn get_publishers(&self, library_id: Option<String>) -> Result<Vec<String>> {
        self.get_json(&["api", "v1", "publishers"], &library_filter(library_id)).await
    }

    async fn get_age_ratings(&self, library_id: Option<String>) -> Result<Vec<String>> {
        self.get_json(&["api", "v1", "age-ratings"], &library_filter(library_id)).await
    }
}
