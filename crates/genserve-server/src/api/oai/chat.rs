use salvo::prelude::*;

use super::respond;

/// Generate chat completions for the given conversation.
///
/// The body follows the OpenAI chat completions schema. The `model` field picks the
/// servable and `stream: true` switches to server-sent events.
#[endpoint(
    responses(
        (status_code = 200, description = "One response if `stream` is false, SSE chunks ending with `[DONE]` otherwise."),
        (status_code = 400, description = "The request is invalid.", body = crate::api::ErrorResponse),
        (status_code = 404, description = "No servable with the requested name.", body = crate::api::ErrorResponse),
    )
)]
pub async fn chat_completions(depot: &mut Depot, req: &mut Request, res: &mut Response) {
    respond(depot, req, res).await
}
