use genserve_core::PipelineType;
use salvo::{
    oapi::{ToResponse, ToSchema},
    prelude::*,
};
use serde::Serialize;

use crate::{api::render_error, types::AppState};

#[derive(Debug, Serialize, ToSchema)]
struct ModelChoice {
    id: String,
    object: String,
    owned_by: String,
    pipeline_type: PipelineType,
}

#[derive(Debug, Serialize, ToSchema, ToResponse)]
pub struct ModelResponse {
    object: String,
    data: Vec<ModelChoice>,
}

impl From<&AppState> for ModelResponse {
    fn from(state: &AppState) -> Self {
        let data = state
            .servables
            .iter()
            .map(|servable| ModelChoice {
                id: servable.name().to_owned(),
                object: "model".into(),
                owned_by: "genserve".into(),
                pipeline_type: servable.pipeline_type(),
            })
            .collect();
        Self {
            object: "list".into(),
            data,
        }
    }
}

/// Names of the configured servables.
#[endpoint(responses((status_code = 200, body = ModelResponse)))]
pub async fn models(depot: &mut Depot, res: &mut Response) {
    match depot.obtain::<AppState>() {
        Ok(state) => res.render(Json(ModelResponse::from(state))),
        Err(_) => render_error(res, StatusCode::INTERNAL_SERVER_ERROR, "servables are not loaded"),
    }
}

#[cfg(test)]
mod tests {
    use genserve_core::{initialize, ServableConfig};

    use super::*;

    #[test]
    fn test_list_servables() {
        let config = ServableConfig {
            name: "echo".into(),
            models_path: "does/not/exist".into(),
            ..Default::default()
        };
        let state = AppState::new(vec![initialize(&config).expect("test")]);
        let response = serde_json::to_value(ModelResponse::from(&state)).expect("test");
        assert_eq!(response["object"], "list");
        assert_eq!(response["data"][0]["id"], "echo");
        assert_eq!(response["data"][0]["pipeline_type"], "continuous_batching");
    }
}
