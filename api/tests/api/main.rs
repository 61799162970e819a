mod helpers;
mod test_github;
mod test_notifications;
mod test_query;
mod test_scheduler;
mod test_sync;
mod test_views;
