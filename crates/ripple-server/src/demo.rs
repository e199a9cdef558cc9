//! Demo functions over [`MemoryStore`], so the binary serves something out
//! of the box.

use async_trait::async_trait;
use ripple_core::{ChangeOperation, ReactiveError, ReplicationMode, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::functions::{FunctionHandler, FunctionInput, FunctionRegistry, HandlerContext, ReactiveFunction};
use crate::store::MemoryStore;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListInput {
    pub organization_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl ListInput {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }
}

impl FunctionInput for ListInput {
    fn validate(&self) -> Result<()> {
        require_non_empty("organizationId", &self.organization_id)?;
        if let Some(limit) = self.limit
            && (limit == 0 || limit > MAX_LIMIT)
        {
            return Err(ReactiveError::validation(format!(
                "limit must be between 1 and {MAX_LIMIT}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserInput {
    pub name: String,
    pub email: String,
    pub organization_id: String,
}

impl FunctionInput for CreateUserInput {
    fn validate(&self) -> Result<()> {
        require_non_empty("name", &self.name)?;
        require_non_empty("organizationId", &self.organization_id)?;
        match self.email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
            _ => Err(ReactiveError::validation("email must be a valid address")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePostInput {
    pub title: String,
    #[serde(default)]
    pub content: Option<String>,
    pub author_id: String,
    pub organization_id: String,
}

impl FunctionInput for CreatePostInput {
    fn validate(&self) -> Result<()> {
        require_non_empty("title", &self.title)?;
        require_non_empty("organizationId", &self.organization_id)?;
        uuid::Uuid::parse_str(&self.author_id)
            .map_err(|_| ReactiveError::validation("authorId must be a UUID"))?;
        Ok(())
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ReactiveError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}

fn in_organization(row: &Value, organization_id: &str) -> bool {
    row.get("organizationId").and_then(Value::as_str) == Some(organization_id)
}

pub struct ListUsers;

#[async_trait]
impl FunctionHandler<MemoryStore> for ListUsers {
    type Input = ListInput;
    type Output = Vec<Value>;

    async fn handle(&self, ctx: HandlerContext<'_, MemoryStore, ListInput>) -> Result<Vec<Value>> {
        let org = ctx.input.organization_id.as_str();
        Ok(ctx
            .store
            .select("users", |row| in_organization(row, org), ctx.input.limit()))
    }
}

pub struct CreateUser;

#[async_trait]
impl FunctionHandler<MemoryStore> for CreateUser {
    type Input = CreateUserInput;
    type Output = Value;

    async fn handle(&self, ctx: HandlerContext<'_, MemoryStore, CreateUserInput>) -> Result<Value> {
        let input = ctx.input;
        let taken = !ctx
            .store
            .select(
                "users",
                |row| {
                    in_organization(row, &input.organization_id)
                        && row.get("email").and_then(Value::as_str) == Some(input.email.as_str())
                },
                1,
            )
            .is_empty();
        if taken {
            return Err(ReactiveError::validation(format!(
                "email {} is already registered",
                input.email
            )));
        }

        Ok(ctx.store.insert(
            ctx.tx,
            "users",
            json!({
                "name": input.name,
                "email": input.email,
                "organizationId": input.organization_id,
            }),
        ))
    }
}

/// Posts of an organization, each with its author embedded.
pub struct ListPosts;

#[async_trait]
impl FunctionHandler<MemoryStore> for ListPosts {
    type Input = ListInput;
    type Output = Vec<Value>;

    async fn handle(&self, ctx: HandlerContext<'_, MemoryStore, ListInput>) -> Result<Vec<Value>> {
        let org = ctx.input.organization_id.as_str();
        let mut posts = ctx
            .store
            .select("posts", |row| in_organization(row, org), ctx.input.limit());
        for post in &mut posts {
            let author = post
                .get("authorId")
                .and_then(Value::as_str)
                .and_then(|id| ctx.store.find("users", id))
                .unwrap_or(Value::Null);
            if let Some(fields) = post.as_object_mut() {
                fields.insert("author".into(), author);
            }
        }
        Ok(posts)
    }
}

pub struct CreatePost;

#[async_trait]
impl FunctionHandler<MemoryStore> for CreatePost {
    type Input = CreatePostInput;
    type Output = Value;

    async fn handle(&self, ctx: HandlerContext<'_, MemoryStore, CreatePostInput>) -> Result<Value> {
        let input = ctx.input;
        let author = ctx
            .store
            .find("users", &input.author_id)
            .filter(|user| in_organization(user, &input.organization_id));
        if author.is_none() {
            return Err(ReactiveError::validation(format!(
                "author {} not found in organization {}",
                input.author_id, input.organization_id
            )));
        }

        Ok(ctx.store.insert(
            ctx.tx,
            "posts",
            json!({
                "title": input.title,
                "content": input.content,
                "authorId": input.author_id,
                "organizationId": input.organization_id,
            }),
        ))
    }
}

/// Register `users.getAll`, `users.create`, `posts.getAll` and `posts.create`.
pub fn register_demo_functions(registry: &FunctionRegistry<MemoryStore>) -> Result<()> {
    registry.register(
        ReactiveFunction::query("users.getAll", ListUsers)
            .depends_on(["users"])
            .build()?,
    )?;
    registry.register(
        ReactiveFunction::mutation("users.create", ChangeOperation::Create, CreateUser)
            .depends_on(["users"])
            .transactional(ReplicationMode::Default)
            .build()?,
    )?;
    registry.register(
        ReactiveFunction::query("posts.getAll", ListPosts)
            .depends_on(["posts", "users"])
            .build()?,
    )?;
    registry.register(
        ReactiveFunction::mutation("posts.create", ChangeOperation::Create, CreatePost)
            .depends_on(["posts"])
            .transactional(ReplicationMode::Strong)
            .build()?,
    )?;
    Ok(())
}
