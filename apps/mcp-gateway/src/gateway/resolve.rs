use crate::auth::{AuthError, BearerToken};
use crate::error::ApiError;
use crate::model::{Actor, ServerDeployment, ServerInstance, Session};
use crate::state::AppState;

/// The instance a request addresses, checked against its caller.
pub struct Target {
    pub actor: Actor,
    pub instance: ServerInstance,
    pub deployment: ServerDeployment,
}

pub async fn authorize(
    state: &AppState,
    token: Option<BearerToken>,
    server_instance_id: &str,
) -> Result<Target, ApiError> {
    let BearerToken(token) = token.ok_or(AuthError::Missing)?;
    let actor = state.auth().authenticate(&token).await?;

    let directory = &state.stores().directory;
    let instance = directory
        .server_instance(server_instance_id)
        .await?
        .ok_or(ApiError::NotFound("server instance not found"))?;
    if instance.organization_id != actor.organization_id {
        return Err(ApiError::Forbidden("server instance belongs to another organization"));
    }
    let deployment = directory
        .deployment(&instance.server_deployment_id)
        .await?
        .ok_or(ApiError::NotFound("server deployment not found"))?;
    Ok(Target {
        actor,
        instance,
        deployment,
    })
}

/// Load the session the client named, if any.
pub async fn existing_session(
    state: &AppState,
    target: &Target,
    session_id: Option<&str>,
) -> Result<Option<Session>, ApiError> {
    let Some(session_id) = session_id else {
        return Ok(None);
    };
    let session = state
        .stores()
        .sessions
        .get_session(session_id)
        .await?
        .filter(|session| session.server_instance_id == target.instance.id)
        .ok_or(ApiError::NotFound("session not found"))?;
    if session.is_archived() {
        return Err(ApiError::Conflict("session is archived"));
    }
    Ok(Some(session))
}

pub async fn create_session(state: &AppState, target: &Target) -> Result<Session, ApiError> {
    let session = state
        .stores()
        .sessions
        .create_session(Session::new(&target.actor, &target.instance.id))
        .await?;
    tracing::info!(
        session_id = %session.id,
        server_instance_id = %target.instance.id,
        "session created"
    );
    Ok(session)
}
