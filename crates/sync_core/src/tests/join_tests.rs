use super::*;
use std::time::Duration;

use shared::domain::RecordId;

fn delayed(
    millis: u64,
    outcome: Result<Partial<u32>, SyncError>,
) -> impl Future<Output = Result<Partial<u32>, SyncError>> {
    async move {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        outcome
    }
}

#[tokio::test(start_paused = true)]
async fn first_error_follows_completion_order() {
    let gathered = gather(vec![
        delayed(30, Err(SyncError::NotFound(RecordId::from("slow")))),
        delayed(10, Ok(Partial::complete(7))),
        delayed(20, Err(SyncError::NotFound(RecordId::from("fast")))),
    ])
    .await;

    assert_eq!(
        gathered.first_error,
        Some(SyncError::NotFound(RecordId::from("fast")))
    );
    assert_eq!(gathered.slots, vec![None, Some(7), None]);
}

#[tokio::test(start_paused = true)]
async fn partial_values_are_kept_with_their_error() {
    let gathered = gather(vec![
        delayed(
            5,
            Ok(Partial {
                value: 1,
                error: Some(SyncError::PartialBatchFailure {
                    failed: vec![RecordId::from("x")],
                }),
            }),
        ),
        delayed(1, Ok(Partial::complete(2))),
    ])
    .await;

    assert!(gathered
        .first_error
        .as_ref()
        .is_some_and(SyncError::is_partial));
    assert_eq!(gathered.successes(), vec![1, 2]);
}

#[tokio::test]
async fn empty_task_list_completes_immediately() {
    let gathered = gather(Vec::<std::future::Ready<Result<Partial<u32>, SyncError>>>::new()).await;
    assert!(gathered.slots.is_empty());
    assert!(gathered.first_error.is_none());
}
