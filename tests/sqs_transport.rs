use chrono::{TimeZone, Utc};
use kube_pico_cd::queue::sigv4::{RequestSigner, SigningRequest};
use kube_pico_cd::queue::sqs::error_from_response;
use kube_pico_cd::{CredentialProvider, CredentialSource, Credentials, QueueError, SqsClient};

fn vanilla_signer() -> RequestSigner {
    RequestSigner::new(
        "AKIDEXAMPLE",
        "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
        "us-east-1",
        "service",
    )
}

fn vanilla_request() -> SigningRequest<'static> {
    SigningRequest {
        method: "GET",
        host: "example.amazonaws.com",
        path: "/",
        query: "",
        headers: &[],
        payload: b"",
    }
}

#[test]
fn signs_get_vanilla_request() {
    let now = Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap();
    let signed = vanilla_signer().sign(&vanilla_request(), now).unwrap();

    assert_eq!(signed.amz_date, "20150830T123600Z");
    assert_eq!(
        signed.authorization,
        "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/service/aws4_request, \
         SignedHeaders=host;x-amz-date, \
         Signature=5fa00fa31553b73ebf1942676e86291e8372ff2a2260956d9b8aae1d763fbf31"
    );
    assert_eq!(signed.security_token, None);
}

#[test]
fn session_token_is_signed() {
    let now = Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap();
    let signer = vanilla_signer().with_session_token(Some("token".into()));
    let signed = signer.sign(&vanilla_request(), now).unwrap();

    assert!(signed
        .authorization
        .contains("SignedHeaders=host;x-amz-date;x-amz-security-token,"));
    assert_eq!(signed.security_token.as_deref(), Some("token"));

    let blank = vanilla_signer().with_session_token(Some(String::new()));
    assert_eq!(blank.sign(&vanilla_request(), now).unwrap().security_token, None);
}

#[test]
fn extra_headers_change_the_signature() {
    let now = Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap();
    let plain = vanilla_signer().sign(&vanilla_request(), now).unwrap();
    let request = SigningRequest {
        headers: &[("X-Amz-Target", "AmazonSQS.ReceiveMessage")],
        ..vanilla_request()
    };
    let targeted = vanilla_signer().sign(&request, now).unwrap();

    assert!(targeted
        .authorization
        .contains("SignedHeaders=host;x-amz-date;x-amz-target,"));
    assert_ne!(plain.authorization, targeted.authorization);
}

#[test]
fn missing_queue_errors_map_to_not_found() {
    let json = r#"{"__type":"com.amazonaws.sqs#QueueDoesNotExist","message":"The specified queue does not exist."}"#;
    assert_eq!(
        error_from_response("deploy-prod", 400, json),
        QueueError::NotFound {
            queue: "deploy-prod".into()
        }
    );

    let legacy = r#"{"__type":"AWS.SimpleQueueService.NonExistentQueue"}"#;
    assert!(matches!(
        error_from_response("deploy-prod", 400, legacy),
        QueueError::NotFound { .. }
    ));
}

#[test]
fn other_errors_keep_their_code() {
    let json = r#"{"__type":"com.amazonaws.sqs#ThrottlingException","message":"Rate exceeded"}"#;
    assert_eq!(
        error_from_response("deploy-prod", 400, json),
        QueueError::Rejected {
            code: "ThrottlingException".into(),
            message: "Rate exceeded".into(),
        }
    );

    assert_eq!(
        error_from_response("deploy-prod", 503, " Service Unavailable \n"),
        QueueError::Rejected {
            code: "HTTP503".into(),
            message: "Service Unavailable".into(),
        }
    );
}

fn credentials() -> CredentialProvider {
    CredentialProvider::new(
        CredentialSource::Static(Credentials::new("AKIDEXAMPLE", "secret")),
        "eu-west-1",
    )
    .unwrap()
}

#[test]
fn client_rejects_unusable_endpoints() {
    assert!(matches!(
        SqsClient::new(" ", None, credentials()),
        Err(QueueError::Configuration(_))
    ));
    assert!(matches!(
        SqsClient::new("eu-west-1", Some("not a url"), credentials()),
        Err(QueueError::Configuration(_))
    ));
    assert!(SqsClient::new("eu-west-1", Some("http://localhost:9324"), credentials()).is_ok());
    assert!(SqsClient::new("eu-west-1", None, credentials()).is_ok());
}
