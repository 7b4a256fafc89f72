// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use dropshot::ClientErrorStatusCode;
use dropshot::HttpError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0}")]
    Internal(String),
}

impl From<Error> for HttpError {
    fn from(value: Error) -> Self {
        match value {
            Error::Invalid(_) => HttpError::for_bad_request(
                None,
                value.to_string(),
            ),
            Error::Unauthorized => HttpError::for_client_error(
                Some("Unauthorized".into()),
                ClientErrorStatusCode::UNAUTHORIZED,
                value.to_string(),
            ),
            Error::Internal(_) => {
                HttpError::for_internal_error(value.to_string())
            }
        }
    }
}
