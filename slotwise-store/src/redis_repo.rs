use redis::RedisResult;

#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client })
    }

    /// Fixed-window counter. Returns false once `limit` is exceeded within
    /// the window.
    pub async fn check_rate_limit(&self, key: &str, limit: i64, window_seconds: i64) -> RedisResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let (count,): (i64,) = window_counter(key, window_seconds).query_async(&mut conn).await?;
        Ok(count <= limit)
    }
}

fn window_counter(key: &str, window_seconds: i64) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    // NX: only the request that opens the window sets its expiry, so later
    // requests cannot push the reset out.
    pipe.atomic()
        .incr(key, 1)
        .cmd("EXPIRE")
        .arg(key)
        .arg(window_seconds)
        .arg("NX")
        .ignore();
    pipe
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_expiry_only_set_when_opened() {
        let packed = String::from_utf8(window_counter("rl:parent@example.com", 60).get_packed_pipeline()).unwrap();
        let expire = packed.find("EXPIRE").unwrap();
        assert!(packed[expire..].contains("$2\r\n60\r\n$2\r\nNX\r\n"));
        assert_eq!(packed.matches("INCR").count(), 1);
    }
}
