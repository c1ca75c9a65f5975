//! HTTP API for the portal
//!
//! JSON in and out, camelCase bodies. The auth proxy in front of us sets
//! `x-user-id`; when a portal key is configured every request must also
//! carry it in `x-portal-key`.

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use portal_core::{
    AccessCheck, AccessGate, Agent, AgentStore, BaseModel, ChatRelay, CompiledContext,
    ContextCompiler, ContextRequest, Conversation, ConversationStore, CoreError, DocumentOutcome,
    DocumentProcessor, DocumentRequest, EmbedAllReport, EmbeddingService, LlmClient, LlmError,
    Message, MemoryWeaver, ModelCatalog, NewAgent, NewBaseModel, PortalConfig, RelayReply,
    SourceType, User, UserStore, WeaveReport,
};
use portal_memory::{
    ConnectedMemory, Database, LinkSet, LinkStore, MemoryError, MemoryLink, MemoryRecord,
    MemoryStore, MemoryType, NewLink, NewMemory, ProfilePatch, ProfileStore, ScoredMemory,
    SubjectProfile,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const PORTAL_KEY_HEADER: &str = "x-portal-key";

const DEFAULT_LIST_LIMIT: usize = 20;
const DEFAULT_DEPTH: usize = 1;

/// Everything the handlers need, built once at startup
pub struct AppState {
    pub memories: MemoryStore,
    pub links: LinkStore,
    pub profiles: ProfileStore,
    pub users: UserStore,
    pub catalog: ModelCatalog,
    pub agents: AgentStore,
    pub conversations: ConversationStore,
    pub compiler: ContextCompiler,
    pub embeddings: EmbeddingService,
    pub relay: ChatRelay,
    pub weaver: MemoryWeaver,
    pub documents: DocumentProcessor,
    pub gate: AccessGate,
    /// Used for titles when no default model has been selected
    pub fallback_model: String,
}

impl AppState {
    pub fn new(db: &Database, llm: Arc<dyn LlmClient>, config: &PortalConfig) -> Self {
        Self {
            memories: MemoryStore::new(db),
            links: LinkStore::new(db),
            profiles: ProfileStore::new(db),
            users: UserStore::new(db),
            catalog: ModelCatalog::new(db),
            agents: AgentStore::new(db),
            conversations: ConversationStore::new(db),
            compiler: ContextCompiler::new(db),
            embeddings: EmbeddingService::new(db, llm.clone()),
            relay: ChatRelay::new(db, llm.clone(), config.history_limit),
            weaver: MemoryWeaver::new(db, llm.clone(), config.extraction_model.clone()),
            documents: DocumentProcessor::new(db, llm, config.extraction_model.clone()),
            gate: AccessGate::new(config.portal_key.clone()),
            fallback_model: config.extraction_model.clone(),
        }
    }
}

type SharedState = Arc<AppState>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/access/check", post(check_access))
        .route("/api/me", get(get_me).patch(update_me))
        .route("/api/memories", get(list_memories).post(upsert_memory))
        .route("/api/memories/:id", get(get_memory).delete(deactivate_memory))
        .route("/api/memories/:id/links", get(memory_links))
        .route("/api/memories/:id/connected", get(connected_memories))
        .route("/api/memories/:id/embedding", post(embed_memory))
        .route("/api/links", post(upsert_link))
        .route("/api/search", get(search_memories))
        .route("/api/search/semantic", post(semantic_search))
        .route("/api/embeddings", post(embed_all))
        .route("/api/profile", get(get_profile).patch(update_profile))
        .route("/api/context", post(compile_context))
        .route("/api/models", get(list_models).post(upsert_model))
        .route("/api/models/default", get(default_model).put(select_default_model))
        .route("/api/models/:id/toggle", post(toggle_model))
        .route("/api/agents", get(list_agents).post(create_agent))
        .route("/api/agents/:id", get(get_agent))
        .route(
            "/api/conversations",
            get(list_conversations).post(begin_conversation),
        )
        .route("/api/conversations/favorites", get(favorite_conversations))
        .route(
            "/api/conversations/:id",
            get(get_conversation)
                .patch(rename_conversation)
                .delete(delete_conversation),
        )
        .route("/api/conversations/:id/archive", post(archive_conversation))
        .route("/api/conversations/:id/favorite", post(favorite_conversation))
        .route(
            "/api/conversations/:id/messages",
            get(list_messages).post(send_message),
        )
        .route("/api/conversations/:id/title", post(title_conversation))
        .route("/api/messages/:id/favorite", post(favorite_message))
        .route("/api/titles", post(name_unnamed))
        .route("/api/extract", post(extract_memories))
        .route("/api/documents", post(process_document))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
}

/// `{"error": {"code", "message"}}` with a matching status
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    pub error: ApiErrorDetail,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            error: ApiErrorDetail {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let message = err.to_string();
        match err {
            CoreError::Unauthorized(_) => Self::unauthorized(message),
            CoreError::Forbidden(_) => Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message),
            CoreError::NotFound(_) | CoreError::Memory(MemoryError::NotFound(_)) => {
                Self::not_found(message)
            }
            CoreError::InvalidInput(_)
            | CoreError::Memory(
                MemoryError::InvalidDepth(_)
                | MemoryError::UnknownMemoryType(_)
                | MemoryError::UnknownLinkType(_)
                | MemoryError::DimensionMismatch { .. },
            ) => Self::new(StatusCode::BAD_REQUEST, "INVALID_INPUT", message),
            CoreError::Llm(LlmError::MissingApiKey) | CoreError::Config(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "CONFIGURATION", message)
            }
            CoreError::Llm(_) => Self::new(StatusCode::BAD_GATEWAY, "UPSTREAM", message),
            _ => {
                tracing::error!(error = %message, "Request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", message)
            }
        }
    }
}

impl From<MemoryError> for ApiError {
    fn from(err: MemoryError) -> Self {
        CoreError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// =============================================================================
// Caller identity
// =============================================================================

/// The authenticated user making the request
pub struct Caller(pub String);

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[async_trait]
impl FromRequestParts<SharedState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        state.gate.verify(header(&parts.headers, PORTAL_KEY_HEADER))?;

        let user_id = header(&parts.headers, USER_ID_HEADER)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::unauthorized(format!("missing {USER_ID_HEADER} header")))?
            .to_string();

        state.users.ensure(&user_id, None).await?;
        Ok(Caller(user_id))
    }
}

async fn require_admin(state: &AppState, caller: &Caller) -> Result<(), ApiError> {
    state.users.require_admin(&caller.0).await?;
    Ok(())
}

// =============================================================================
// Health and access
// =============================================================================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct AccessCheckRequest {
    #[serde(default)]
    key: Option<String>,
}

/// POST /api/access/check
async fn check_access(
    State(state): State<SharedState>,
    Json(request): Json<AccessCheckRequest>,
) -> Json<AccessCheck> {
    Json(state.gate.check(request.key.as_deref()))
}

// =============================================================================
// Accounts
// =============================================================================

async fn get_me(State(state): State<SharedState>, caller: Caller) -> ApiResult<User> {
    let user = state
        .users
        .get(&caller.0)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("user {}", caller.0)))?;
    Ok(Json(user))
}

#[derive(Deserialize)]
struct UpdateMeRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    image: Option<String>,
}

async fn update_me(
    State(state): State<SharedState>,
    caller: Caller,
    Json(request): Json<UpdateMeRequest>,
) -> ApiResult<User> {
    let user = state
        .users
        .update_profile(&caller.0, request.name, request.image)
        .await?;
    Ok(Json(user))
}

// =============================================================================
// Memories and links
// =============================================================================

#[derive(Deserialize)]
struct ListMemoriesQuery {
    #[serde(default, rename = "type")]
    memory_type: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

/// GET /api/memories?type=core, or the top memories by resonance without a type
async fn list_memories(
    State(state): State<SharedState>,
    _caller: Caller,
    Query(query): Query<ListMemoriesQuery>,
) -> ApiResult<Vec<MemoryRecord>> {
    let memories = match query.memory_type {
        Some(t) => state.memories.list_by_type(t.parse::<MemoryType>()?).await?,
        None => {
            state
                .memories
                .top_by_resonance(query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
                .await?
        }
    };
    Ok(Json(memories))
}

async fn upsert_memory(
    State(state): State<SharedState>,
    _caller: Caller,
    Json(memory): Json<NewMemory>,
) -> ApiResult<MemoryRecord> {
    Ok(Json(state.memories.upsert(memory).await?))
}

async fn get_memory(
    State(state): State<SharedState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<MemoryRecord> {
    let memory = state
        .memories
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("memory {id}")))?;
    Ok(Json(memory))
}

async fn deactivate_memory(
    State(state): State<SharedState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.memories.deactivate(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn memory_links(
    State(state): State<SharedState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<LinkSet> {
    Ok(Json(state.links.links_for(&id).await?))
}

#[derive(Deserialize)]
struct DepthQuery {
    #[serde(default)]
    depth: Option<usize>,
}

async fn connected_memories(
    State(state): State<SharedState>,
    _caller: Caller,
    Path(id): Path<String>,
    Query(query): Query<DepthQuery>,
) -> ApiResult<Vec<ConnectedMemory>> {
    let depth = query.depth.unwrap_or(DEFAULT_DEPTH);
    Ok(Json(state.links.connected(&id, depth).await?))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EmbedMemoryResponse {
    memory_id: String,
    tokens_used: u32,
}

async fn embed_memory(
    State(state): State<SharedState>,
    _caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<EmbedMemoryResponse> {
    let tokens_used = state.embeddings.embed_memory(&id).await?;
    Ok(Json(EmbedMemoryResponse {
        memory_id: id,
        tokens_used,
    }))
}

async fn upsert_link(
    State(state): State<SharedState>,
    _caller: Caller,
    Json(link): Json<NewLink>,
) -> ApiResult<MemoryLink> {
    Ok(Json(state.links.upsert_link(link).await?))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default, rename = "type")]
    memory_type: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn search_memories(
    State(state): State<SharedState>,
    _caller: Caller,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Vec<MemoryRecord>> {
    let memory_type = query
        .memory_type
        .map(|t| t.parse::<MemoryType>())
        .transpose()?;
    let hits = state
        .memories
        .search(&query.q, memory_type, query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await?;
    Ok(Json(hits))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SemanticSearchRequest {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    min_similarity: Option<f64>,
}

async fn semantic_search(
    State(state): State<SharedState>,
    _caller: Caller,
    Json(request): Json<SemanticSearchRequest>,
) -> ApiResult<Vec<ScoredMemory>> {
    let hits = state
        .embeddings
        .semantic_search(
            &request.query,
            request
                .limit
                .unwrap_or(portal_core::embeddings::DEFAULT_SEARCH_LIMIT),
            request
                .min_similarity
                .unwrap_or(portal_core::embeddings::DEFAULT_MIN_SIMILARITY),
        )
        .await?;
    Ok(Json(hits))
}

/// POST /api/embeddings (admin): embed every memory that has no vector yet
async fn embed_all(State(state): State<SharedState>, caller: Caller) -> ApiResult<EmbedAllReport> {
    require_admin(&state, &caller).await?;
    Ok(Json(state.embeddings.embed_all().await?))
}

// =============================================================================
// Profile and context
// =============================================================================

async fn get_profile(
    State(state): State<SharedState>,
    caller: Caller,
) -> ApiResult<SubjectProfile> {
    let profile = state
        .profiles
        .get(&caller.0)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("profile {}", caller.0)))?;
    Ok(Json(profile))
}

async fn update_profile(
    State(state): State<SharedState>,
    caller: Caller,
    Json(patch): Json<ProfilePatch>,
) -> ApiResult<SubjectProfile> {
    Ok(Json(state.profiles.upsert(&caller.0, patch).await?))
}

/// POST /api/context. The subject defaults to the caller; compiling for
/// anyone else requires admin.
async fn compile_context(
    State(state): State<SharedState>,
    caller: Caller,
    Json(mut request): Json<ContextRequest>,
) -> ApiResult<CompiledContext> {
    let subject = request.subject_id.get_or_insert_with(|| caller.0.clone());
    if *subject != caller.0 {
        require_admin(&state, &caller).await?;
    }
    Ok(Json(state.compiler.compile(&request).await?))
}

// =============================================================================
// Model catalog
// =============================================================================

async fn list_models(State(state): State<SharedState>) -> ApiResult<Vec<BaseModel>> {
    Ok(Json(state.catalog.list_active().await?))
}

async fn upsert_model(
    State(state): State<SharedState>,
    caller: Caller,
    Json(model): Json<NewBaseModel>,
) -> ApiResult<BaseModel> {
    require_admin(&state, &caller).await?;
    Ok(Json(state.catalog.upsert_by_model_id(model).await?))
}

async fn default_model(State(state): State<SharedState>) -> ApiResult<BaseModel> {
    let model = state
        .catalog
        .current_default()
        .await?
        .ok_or_else(|| ApiError::not_found("no default model selected"))?;
    Ok(Json(model))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectDefaultRequest {
    base_model_id: String,
}

async fn select_default_model(
    State(state): State<SharedState>,
    caller: Caller,
    Json(request): Json<SelectDefaultRequest>,
) -> ApiResult<BaseModel> {
    require_admin(&state, &caller).await?;
    Ok(Json(state.catalog.select_default(&request.base_model_id).await?))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToggleResponse {
    is_active: bool,
}

async fn toggle_model(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<ToggleResponse> {
    require_admin(&state, &caller).await?;
    let is_active = state.catalog.toggle_active(&id).await?;
    Ok(Json(ToggleResponse { is_active }))
}

// =============================================================================
// Agents
// =============================================================================

async fn list_agents(State(state): State<SharedState>, caller: Caller) -> ApiResult<Vec<Agent>> {
    Ok(Json(state.agents.list_for_user(&caller.0).await?))
}

async fn create_agent(
    State(state): State<SharedState>,
    caller: Caller,
    Json(agent): Json<NewAgent>,
) -> Result<(StatusCode, Json<Agent>), ApiError> {
    let agent = state.agents.create(&caller.0, agent).await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

async fn get_agent(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Agent> {
    Ok(Json(state.agents.get_owned(&caller.0, &id).await?))
}

// =============================================================================
// Conversations and messages
// =============================================================================

async fn list_conversations(
    State(state): State<SharedState>,
    caller: Caller,
) -> ApiResult<Vec<Conversation>> {
    Ok(Json(state.conversations.list_for_user(&caller.0).await?))
}

async fn favorite_conversations(
    State(state): State<SharedState>,
    caller: Caller,
) -> ApiResult<Vec<Conversation>> {
    Ok(Json(state.conversations.favorites(&caller.0).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BeginRequest {
    agent_id: String,
    #[serde(default)]
    title: Option<String>,
}

async fn begin_conversation(
    State(state): State<SharedState>,
    caller: Caller,
    Json(request): Json<BeginRequest>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let conversation = state
        .conversations
        .begin(&caller.0, &request.agent_id, request.title)
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn get_conversation(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Conversation> {
    Ok(Json(state.conversations.get_owned(&caller.0, &id).await?))
}

#[derive(Deserialize)]
struct RenameRequest {
    title: String,
}

async fn rename_conversation(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> ApiResult<Conversation> {
    let title = request.title.trim();
    if title.is_empty() {
        return Err(ApiError::from(CoreError::InvalidInput(
            "title must not be empty".to_string(),
        )));
    }
    Ok(Json(state.conversations.rename(&caller.0, &id, title).await?))
}

async fn delete_conversation(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.conversations.delete(&caller.0, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn archive_conversation(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.conversations.archive(&caller.0, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FavoriteResponse {
    is_favorite: bool,
}

async fn favorite_conversation(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<FavoriteResponse> {
    let is_favorite = state.conversations.toggle_favorite(&caller.0, &id).await?;
    Ok(Json(FavoriteResponse { is_favorite }))
}

async fn list_messages(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Vec<Message>> {
    state.conversations.get_owned(&caller.0, &id).await?;
    Ok(Json(state.conversations.list(&id).await?))
}

#[derive(Deserialize)]
struct SendRequest {
    content: String,
}

/// POST /api/conversations/:id/messages: one user turn and the agent's reply
async fn send_message(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(request): Json<SendRequest>,
) -> ApiResult<RelayReply> {
    if request.content.trim().is_empty() {
        return Err(ApiError::from(CoreError::InvalidInput(
            "message content must not be empty".to_string(),
        )));
    }
    Ok(Json(state.relay.send(&caller.0, &id, &request.content).await?))
}

async fn title_conversation(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Conversation> {
    Ok(Json(state.relay.title_conversation(&caller.0, &id).await?))
}

async fn favorite_message(
    State(state): State<SharedState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<FavoriteResponse> {
    let message = state
        .conversations
        .get_message(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("message {id}")))?;
    state
        .conversations
        .get_owned(&caller.0, &message.conversation_id)
        .await?;
    let is_favorite = state.conversations.toggle_message_favorite(&id).await?;
    Ok(Json(FavoriteResponse { is_favorite }))
}

#[derive(Deserialize, Default)]
struct NameUnnamedRequest {
    #[serde(default)]
    model: Option<String>,
}

#[derive(Serialize)]
struct NameUnnamedResponse {
    renamed: usize,
}

/// POST /api/titles (admin): retitle every placeholder-named conversation
async fn name_unnamed(
    State(state): State<SharedState>,
    caller: Caller,
    Json(request): Json<NameUnnamedRequest>,
) -> ApiResult<NameUnnamedResponse> {
    require_admin(&state, &caller).await?;
    let model = match request.model {
        Some(model) => model,
        None => match state.catalog.current_default().await? {
            Some(default) => default.model_id,
            None => state.fallback_model.clone(),
        },
    };
    let renamed = state.relay.name_unnamed(&model).await?;
    Ok(Json(NameUnnamedResponse { renamed }))
}

// =============================================================================
// Extraction pipelines
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractRequest {
    content: String,
    source_type: SourceType,
    source_id: String,
}

/// POST /api/extract: weave memories about the caller out of an exchange
async fn extract_memories(
    State(state): State<SharedState>,
    caller: Caller,
    Json(request): Json<ExtractRequest>,
) -> ApiResult<WeaveReport> {
    let report = state
        .weaver
        .extract_memories(
            &request.content,
            request.source_type,
            &request.source_id,
            Some(&caller.0),
        )
        .await?;
    Ok(Json(report))
}

async fn process_document(
    State(state): State<SharedState>,
    caller: Caller,
    Json(request): Json<DocumentRequest>,
) -> ApiResult<DocumentOutcome> {
    require_admin(&state, &caller).await?;
    Ok(Json(state.documents.process_document(&request).await?))
}
