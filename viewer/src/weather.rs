//! Current weather and air quality from OpenWeather.

use crate::config::WeatherSettings;
use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use url::Url;

/// What the overlay shows.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherReading {
    /// Degrees Celsius, rounded.
    pub temp: i64,
    pub description: String,
    /// OpenWeather air quality index 1..=5, or 0 when unknown.
    pub aqi: u8,
}

impl WeatherReading {
    pub fn aqi_label(&self) -> &'static str {
        aqi_label(self.aqi)
    }

    pub fn caption(&self) -> String {
        format!(
            "{}°C, {} | AQI: {} ({})",
            self.temp,
            self.description,
            self.aqi,
            self.aqi_label()
        )
    }
}

pub fn aqi_label(aqi: u8) -> &'static str {
    match aqi {
        1 => "Good",
        2 => "Fair",
        3 => "Moderate",
        4 => "Poor",
        5 => "Very Poor",
        _ => "N/A",
    }
}

#[derive(Debug, Deserialize)]
struct CurrentWeather {
    main: MainBlock,
    #[serde(default)]
    weather: Vec<Condition>,
}

#[derive(Debug, Deserialize)]
struct MainBlock {
    temp: f64,
}

#[derive(Debug, Deserialize)]
struct Condition {
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct AirPollution {
    #[serde(default)]
    list: Vec<AirSample>,
}

#[derive(Debug, Deserialize)]
struct AirSample {
    main: AirIndex,
}

#[derive(Debug, Deserialize)]
struct AirIndex {
    aqi: u8,
}

pub struct WeatherClient {
    client: reqwest::Client,
    base_url: Url,
    api_key: String,
    latitude: f64,
    longitude: f64,
}

impl WeatherClient {
    pub fn new(client: reqwest::Client, settings: &WeatherSettings) -> Result<Self> {
        let base_url = Url::parse(&settings.base_url).context("Invalid weather base URL")?;
        Ok(Self {
            client,
            base_url,
            api_key: settings.api_key.clone(),
            latitude: settings.latitude,
            longitude: settings.longitude,
        })
    }

    fn endpoint(&self, path: &str, metric: bool) -> Result<Url> {
        let mut url = self
            .base_url
            .join(path)
            .with_context(|| format!("Invalid weather endpoint {}", path))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("lat", &self.latitude.to_string())
                .append_pair("lon", &self.longitude.to_string())
                .append_pair("appid", &self.api_key);
            if metric {
                query.append_pair("units", "metric");
            }
        }
        Ok(url)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, url: Url, what: &str) -> Result<T> {
        self.client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", what))?
            .error_for_status()
            .with_context(|| format!("{} request failed", what))?
            .json()
            .await
            .with_context(|| format!("Failed to parse {}", what))
    }

    /// Fetch weather and air quality together; either failing fails both.
    pub async fn fetch(&self) -> Result<WeatherReading> {
        let weather_url = self.endpoint("/data/2.5/weather", true)?;
        let air_url = self.endpoint("/data/2.5/air_pollution", false)?;

        let (weather, air): (CurrentWeather, AirPollution) = tokio::try_join!(
            self.get(weather_url, "weather"),
            self.get(air_url, "air pollution"),
        )?;

        let description = weather
            .weather
            .into_iter()
            .next()
            .map(|c| c.description)
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| "N/A".to_string());

        Ok(WeatherReading {
            temp: weather.main.temp.round() as i64,
            description,
            aqi: air.list.first().map(|s| s.main.aqi).unwrap_or(0),
        })
    }
}

/// Refresh the weather periodically. A failed refresh clears the reading.
pub fn spawn_weather(
    client: WeatherClient,
    refresh: Duration,
) -> watch::Receiver<Option<WeatherReading>> {
    let (tx, rx) = watch::channel(None);

    tokio::spawn(async move {
        loop {
            let reading = match client.fetch().await {
                Ok(reading) => {
                    tracing::debug!("Weather: {}", reading.caption());
                    Some(reading)
                }
                Err(e) => {
                    tracing::warn!("Weather refresh failed: {:#}", e);
                    None
                }
            };
            if tx.send(reading).is_err() {
                break;
            }
            sleep(refresh).await;
        }
    });

    rx
}
