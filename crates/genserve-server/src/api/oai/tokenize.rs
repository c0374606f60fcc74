use salvo::prelude::*;

use super::respond;

/// Token ids of one text or a batch of texts, as the servable's tokenizer encodes them.
#[endpoint(
    responses(
        (status_code = 200, description = "`{\"tokens\": [...]}`, nested per input for batches."),
        (status_code = 400, description = "The request is invalid.", body = crate::api::ErrorResponse),
    )
)]
pub async fn tokenize(depot: &mut Depot, req: &mut Request, res: &mut Response) {
    respond(depot, req, res).await
}
