use super::{Args, Tool, ToolResult, arg_str};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::fmt::Write as _;
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Current weather and 3-day forecast via the open-meteo geocoding and
/// forecast APIs (anonymous, no credentials).
pub struct WeatherTool {
    client: reqwest::Client,
    geocoding_base: String,
    forecast_base: String,
}

#[derive(Deserialize)]
struct GeocodingResponse {
    #[serde(default)]
    results: Vec<GeocodingResult>,
}

#[derive(Deserialize)]
struct GeocodingResult {
    name: String,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    country: String,
}

#[derive(Deserialize)]
struct WeatherData {
    current: CurrentWeather,
    daily: DailyForecast,
}

#[derive(Deserialize)]
struct CurrentWeather {
    temperature_2m: f64,
    relative_humidity_2m: f64,
    wind_speed_10m: f64,
    weather_code: i32,
}

#[derive(Deserialize)]
struct DailyForecast {
    time: Vec<String>,
    temperature_2m_max: Vec<f64>,
    temperature_2m_min: Vec<f64>,
    precipitation_probability_max: Vec<f64>,
    weather_code: Vec<i32>,
}

impl WeatherTool {
    pub fn new() -> Self {
        Self::with_endpoints(
            "https://geocoding-api.open-meteo.com",
            "https://api.open-meteo.com",
        )
    }

    pub fn with_endpoints(geocoding_base: &str, forecast_base: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
            geocoding_base: geocoding_base.trim_end_matches('/').to_string(),
            forecast_base: forecast_base.trim_end_matches('/').to_string(),
        }
    }

    async fn geocode(&self, city: &str) -> Result<(f64, f64, String)> {
        let response: GeocodingResponse = self
            .client
            .get(format!("{}/v1/search", self.geocoding_base))
            .query(&[("name", city), ("count", "1"), ("language", "es")])
            .send()
            .await
            .context("geocoding request failed")?
            .json()
            .await
            .context("failed to parse geocoding response")?;

        let Some(result) = response.results.into_iter().next() else {
            anyhow::bail!("location '{city}' not found");
        };

        let mut display_name = result.name;
        if !result.country.is_empty() {
            display_name.push_str(", ");
            display_name.push_str(&result.country);
        }
        Ok((result.latitude, result.longitude, display_name))
    }

    async fn fetch_forecast(&self, lat: f64, lon: f64) -> Result<WeatherData> {
        self.client
            .get(format!("{}/v1/forecast", self.forecast_base))
            .query(&[
                ("latitude", format!("{lat:.4}")),
                ("longitude", format!("{lon:.4}")),
                (
                    "current",
                    "temperature_2m,relative_humidity_2m,wind_speed_10m,weather_code".into(),
                ),
                (
                    "daily",
                    "temperature_2m_max,temperature_2m_min,precipitation_probability_max,weather_code"
                        .into(),
                ),
                ("timezone", "auto".into()),
                ("forecast_days", "3".into()),
            ])
            .send()
            .await
            .context("forecast request failed")?
            .json()
            .await
            .context("failed to parse weather response")
    }
}

impl Default for WeatherTool {
    fn default() -> Self {
        Self::new()
    }
}

fn format_weather(location: &str, weather: &WeatherData) -> String {
    let mut out = format!("Clima en {location}:\n\n");
    let _ = write!(
        out,
        "Ahora: {}, {:.1}°C, humedad {:.0}%, viento {:.1} km/h\n\n",
        weather_code_name(weather.current.weather_code),
        weather.current.temperature_2m,
        weather.current.relative_humidity_2m,
        weather.current.wind_speed_10m
    );

    out.push_str("Pronóstico:\n");
    for (i, date) in weather.daily.time.iter().enumerate() {
        if i >= weather.daily.temperature_2m_max.len() {
            break;
        }
        let _ = writeln!(
            out,
            "- {date}: {}, {:.0}°C / {:.0}°C, lluvia {:.0}%",
            weather_code_name(weather.daily.weather_code[i]),
            weather.daily.temperature_2m_min[i],
            weather.daily.temperature_2m_max[i],
            weather.daily.precipitation_probability_max[i]
        );
    }
    out
}

fn weather_code_name(code: i32) -> String {
    match code {
        0 => "Despejado".into(),
        1 => "Mayormente despejado".into(),
        2 => "Parcialmente nublado".into(),
        3 => "Nublado".into(),
        45 | 48 => "Niebla".into(),
        51 | 53 | 55 => "Llovizna".into(),
        56 | 57 => "Llovizna helada".into(),
        61 | 63 | 65 => "Lluvia".into(),
        66 | 67 => "Lluvia helada".into(),
        71 | 73 | 75 => "Nieve".into(),
        77 => "Granizo".into(),
        80 | 81 | 82 => "Chubascos".into(),
        85 | 86 => "Chubascos de nieve".into(),
        95 => "Tormenta".into(),
        96 | 99 => "Tormenta con granizo".into(),
        other => format!("Código {other}"),
    }
}

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "weather"
    }

    fn description(&self) -> &str {
        "Get current weather and 3-day forecast for a city. Use when the user asks about \
         weather or climate conditions."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "location": {
                    "type": "string",
                    "description": "City name (e.g., 'Buenos Aires', 'London')"
                }
            },
            "required": ["location"]
        })
    }

    async fn execute(&self, args: Args) -> Result<ToolResult> {
        let Some(location) = arg_str(&args, "location") else {
            return Ok(ToolResult::error("location is required"));
        };

        let (lat, lon, name) = match self.geocode(location).await {
            Ok(found) => found,
            Err(error) => {
                return Ok(ToolResult::error(format!(
                    "failed to find location: {error}"
                )));
            }
        };

        match self.fetch_forecast(lat, lon).await {
            Ok(weather) => Ok(ToolResult::silent(format_weather(&name, &weather))),
            Err(error) => Ok(ToolResult::error(format!(
                "failed to fetch weather: {error}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn args(value: Value) -> Args {
        value.as_object().cloned().unwrap()
    }

    async fn mock_geocoding(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/v1/search"))
            .and(query_param("name", "Madrid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{
                    "name": "Madrid",
                    "latitude": 40.4165,
                    "longitude": -3.7026,
                    "country": "España"
                }]
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn reports_current_weather_and_forecast() {
        let server = MockServer::start().await;
        mock_geocoding(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "current": {
                    "temperature_2m": 31.4,
                    "relative_humidity_2m": 38.0,
                    "wind_speed_10m": 12.5,
                    "weather_code": 0
                },
                "daily": {
                    "time": ["2026-08-02", "2026-08-03", "2026-08-04"],
                    "temperature_2m_max": [35.0, 33.0, 30.0],
                    "temperature_2m_min": [21.0, 20.0, 19.0],
                    "precipitation_probability_max": [0.0, 10.0, 40.0],
                    "weather_code": [0, 2, 95]
                }
            })))
            .mount(&server)
            .await;

        let tool = WeatherTool::with_endpoints(&server.uri(), &server.uri());
        let result = tool
            .execute(args(json!({"location": "Madrid"})))
            .await
            .unwrap();

        let text = result.text();
        assert!(text.starts_with("Clima en Madrid, España:"));
        assert!(text.contains("Ahora: Despejado, 31.4°C"));
        assert!(text.contains("- 2026-08-04: Tormenta, 19°C / 30°C, lluvia 40%"));
    }

    #[tokio::test]
    async fn unknown_location_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
            .mount(&server)
            .await;

        let tool = WeatherTool::with_endpoints(&server.uri(), &server.uri());
        let result = tool
            .execute(args(json!({"location": "Nowhereville"})))
            .await
            .unwrap();
        assert!(result.is_error());
        assert!(result.text().contains("not found"));
    }

    #[tokio::test]
    async fn forecast_failure_surfaces_as_error_result() {
        let server = MockServer::start().await;
        mock_geocoding(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let tool = WeatherTool::with_endpoints(&server.uri(), &server.uri());
        let result = tool
            .execute(args(json!({"location": "Madrid"})))
            .await
            .unwrap();
        assert!(result.is_error());
    }

    #[test]
    fn unknown_weather_codes_fall_back_to_the_number() {
        assert_eq!(weather_code_name(42), "Código 42");
    }
}
